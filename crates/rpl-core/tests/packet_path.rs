//! Data-plane handling: HbH option, loop detection, forwarding errors and
//! source routing at a non-storing root.

mod common;

use common::{IFACE, MockPlatform, conf, dio, dodag_id, ll};
use ipnet::Ipv6Net;
use rpl_core::data::PacketMeta;
use rpl_core::{Domain, IcmpError, NoRouteAction, Policy, RouteSource, RplError, SrhAction, SrhEgress};
use rpl_packet::messages::{DaoGroup, DaoMessage, DaoTargetOption, Mop, TransitOption, g_mop_prf};
use std::net::Ipv6Addr;

fn node(tail: u16) -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, tail)
}

fn meta(route_source: RouteSource) -> PacketMeta {
    PacketMeta {
        src: node(0x50),
        dst: node(0x60),
        interface_id: IFACE,
        routed_up: true,
        predecessor: Some(ll(5)),
        route_source,
        next_hop: None,
    }
}

fn joined_domain(platform: &mut MockPlatform) -> Domain {
    let mut domain = Domain::with_seed(Policy::default(), 23);
    platform.set_etx(IFACE, ll(1), 0x100);
    domain
        .dio_received(platform, &dio(256, 240, Some(conf(0))), ll(1), IFACE)
        .unwrap();
    domain.run_parent_selection(platform, 1, None).unwrap();
    domain
}

/// Root with three chained children learnt over non-storing DAOs:
/// root -> ::2 -> ::3 -> ::4
fn root_domain(platform: &mut MockPlatform) -> Domain {
    let mut domain = Domain::with_seed(Policy::default(), 23);
    domain.set_non_storing_downstream_interface(Some(IFACE));
    platform.add_local_address(IFACE, dodag_id());
    domain
        .create_root_dodag(1, dodag_id(), g_mop_prf(true, Mop::NonStoring, 0), conf(0))
        .unwrap();

    for (child, parent) in [(2u16, None), (3, Some(2u16)), (4, Some(3))] {
        let parent_addr = parent.map(node).unwrap_or(dodag_id());
        let dao = DaoMessage {
            instance_id: 1,
            expect_ack: false,
            sequence: 240 + child as u8,
            dodag_id: None,
            groups: vec![DaoGroup {
                targets: vec![DaoTargetOption {
                    prefix: node(child),
                    prefix_len: 128,
                    descriptor: None,
                }],
                transits: vec![TransitOption {
                    external: false,
                    path_control: 0x80,
                    path_sequence: 240,
                    path_lifetime: 0xFF,
                    parent_address: Some(parent_addr),
                }],
            }],
        };
        domain.dao_received(platform, &dao, ll(child), IFACE).unwrap();
    }
    domain
}

#[test]
fn test_rank_error_progression() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform);
    // Our rank is 512, DAGRank 2

    // An upward packet whose sender claims DAGRank 1 went the wrong way
    let mut opt = rpl_packet::RplOption::new(1, 1);
    let meta = meta(RouteSource::RplInstance);
    domain.hbh_forward(&mut platform, &mut opt, &meta).unwrap();
    assert!(opt.rank_error, "first violation sets the R bit");
    assert_eq!(opt.sender_rank, 2, "sender rank rewritten to ours");

    // Same violation with R already set: drop and kick Trickle
    let mut opt = rpl_packet::RplOption::new(1, 1);
    opt.rank_error = true;
    let err = domain.hbh_forward(&mut platform, &mut opt, &meta).unwrap_err();
    assert_eq!(err, RplError::RouteLoop);
    assert_eq!(domain.stats.route_loops, 1);
}

#[test]
fn test_equal_rank_is_a_violation() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform);
    // Sibling at our own DAGRank: strict inequality required
    let mut opt = rpl_packet::RplOption::new(1, 2);
    domain
        .hbh_forward(&mut platform, &mut opt, &meta(RouteSource::RplInstance))
        .unwrap();
    assert!(opt.rank_error);
}

#[test]
fn test_downward_flag_follows_route_source() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform);
    let mut opt = rpl_packet::RplOption::new(1, 3);
    domain
        .hbh_forward(&mut platform, &mut opt, &meta(RouteSource::RplDao))
        .unwrap();
    assert!(opt.down);
    // At most one direction is active
    assert!(!opt.fwd_error);
}

#[test]
fn test_forwarding_error_round_trip() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform);

    // Downward packet, no route, predecessor known: send it back with F
    let mut opt = rpl_packet::RplOption::new(1, 2);
    opt.down = true;
    let m = meta(RouteSource::RplDao);
    let action = domain.no_route(&mut platform, &mut opt, &m);
    assert_eq!(action, NoRouteAction::ReturnToPredecessor { predecessor: ll(5) });
    assert!(opt.fwd_error);

    // The predecessor holds DAO state for the destination; receiving the
    // flagged packet deletes it and clears the bit
    let mut pred_platform = MockPlatform::new();
    let mut pred = joined_domain(&mut pred_platform);
    let dst = m.dst;
    pred.publish_dao_target(1, None, Ipv6Net::new(dst, 128).unwrap(), 3600, false, None)
        .unwrap();
    assert_eq!(pred.instance(1, None).unwrap().targets.len(), 1);

    pred.hbh_received(&mut pred_platform, &mut opt, &m).unwrap();
    assert!(!opt.fwd_error, "F cleared before re-forwarding");
    assert!(pred.instance(1, None).unwrap().targets.is_empty());
}

#[test]
fn test_upward_no_route_is_inconsistency() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform);
    let mut opt = rpl_packet::RplOption::new(1, 3);
    let action = domain.no_route(&mut platform, &mut opt, &meta(RouteSource::RplInstance));
    assert_eq!(action, NoRouteAction::Unreachable);
    assert_eq!(domain.stats.route_loops, 1);
}

#[test]
fn test_root_source_route_computation() {
    let mut platform = MockPlatform::new();
    let mut domain = root_domain(&mut platform);

    let egress = domain
        .srh_for_transmit(&mut platform, 1, &node(4), 64, false)
        .unwrap();
    let SrhEgress::Header { first_hop, addresses } = egress else {
        panic!("expected a source routing header, got {egress:?}");
    };
    assert_eq!(first_hop, node(2));
    assert_eq!(addresses, vec![node(3), node(4)]);

    // Every address is distinct and belongs to the DAO graph
    let mut all = vec![first_hop];
    all.extend(&addresses);
    for (i, a) in all.iter().enumerate() {
        assert!(!all[i + 1..].contains(a), "duplicate hop {a}");
    }

    // Cached: asking again yields the same route
    let again = domain
        .srh_for_transmit(&mut platform, 1, &node(4), 64, false)
        .unwrap();
    assert_eq!(
        again,
        SrhEgress::Header { first_hop, addresses: vec![node(3), node(4)] }
    );
}

#[test]
fn test_single_hop_needs_no_srh() {
    let mut platform = MockPlatform::new();
    let mut domain = root_domain(&mut platform);
    let egress = domain
        .srh_for_transmit(&mut platform, 1, &node(2), 64, false)
        .unwrap();
    assert_eq!(egress, SrhEgress::HbhOnly);
}

#[test]
fn test_hop_limit_truncates_tunnelled_route() {
    let mut platform = MockPlatform::new();
    let mut domain = root_domain(&mut platform);
    let egress = domain
        .srh_for_transmit(&mut platform, 1, &node(4), 2, true)
        .unwrap();
    let SrhEgress::Header { first_hop, addresses } = egress else {
        panic!("expected a header");
    };
    assert_eq!(first_hop, node(2));
    // Truncated at the hop limit: the final destination is not included
    assert_eq!(addresses, vec![node(3)]);
}

#[test]
fn test_dao_loop_disconnects_target() {
    let mut platform = MockPlatform::new();
    let mut domain = root_domain(&mut platform);

    // ::5 and ::6 claim each other as parents
    for (child, parent) in [(5u16, 6u16), (6, 5)] {
        let dao = DaoMessage {
            instance_id: 1,
            expect_ack: false,
            sequence: 250u8.wrapping_add(child as u8),
            dodag_id: None,
            groups: vec![DaoGroup {
                targets: vec![DaoTargetOption {
                    prefix: node(child),
                    prefix_len: 128,
                    descriptor: None,
                }],
                transits: vec![TransitOption {
                    external: false,
                    path_control: 0x80,
                    path_sequence: 240,
                    path_lifetime: 0xFF,
                    parent_address: Some(node(parent)),
                }],
            }],
        };
        domain.dao_received(&mut platform, &dao, ll(child), IFACE).unwrap();
    }

    let err = domain
        .srh_for_transmit(&mut platform, 1, &node(5), 64, false)
        .unwrap_err();
    assert!(matches!(err, RplError::Unreachable | RplError::RouteLoop));
    // The good chain still works
    assert!(domain.srh_for_transmit(&mut platform, 1, &node(4), 64, false).is_ok());
}

#[test]
fn test_srh_forwarding_at_intermediate_node() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 23);
    platform.set_etx(IFACE, node(3), 0x100);

    // We are ::2; the root sent [::3, ::4] with us as first hop
    let mut srh = rpl_packet::srh::encode(&node(2), &[node(3), node(4)], 58);
    let mut dst = node(2);
    let action = domain
        .process_srh(&mut platform, &mut srh, &mut dst, IFACE, 40)
        .unwrap();
    assert_eq!(action, SrhAction::Forward { interface_id: IFACE });
    assert_eq!(dst, node(3), "next address swapped into the destination");
    // A transient on-link route lets the stack forward it
    assert_eq!(platform.routes_with_source(RouteSource::RplSrh).len(), 1);
}

#[test]
fn test_srh_loop_detection() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 23);
    // Both ::7 and an address further down the list are ours
    platform.add_local_address(IFACE, node(7));
    platform.set_etx(IFACE, node(0x50), 0x100);

    // Replayed header: a foreign hop between two of our own addresses
    let mut srh = rpl_packet::srh::encode(&node(7), &[node(0x50), node(7)], 58);
    let mut dst = node(7);
    let err = domain
        .process_srh(&mut platform, &mut srh, &mut dst, IFACE, 40)
        .unwrap_err();
    assert_eq!(err, RplError::RouteLoop);
    assert_eq!(domain.stats.route_loops, 1);
    assert!(matches!(
        platform.icmp_errors.last(),
        Some(IcmpError::ParameterProblem { .. })
    ));
}

#[test]
fn test_srh_segments_left_validation() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 23);
    let mut srh = rpl_packet::srh::encode(&node(2), &[node(3)], 58);
    srh[3] = 9; // more segments than addresses
    let mut dst = node(2);
    let err = domain
        .process_srh(&mut platform, &mut srh, &mut dst, IFACE, 40)
        .unwrap_err();
    assert!(matches!(err, RplError::InconsistentState(_)));
    assert_eq!(
        platform.icmp_errors.last(),
        Some(&IcmpError::ParameterProblem { pointer: 43 })
    );
}

#[test]
fn test_srh_link_gate_rejects_bad_link()
{
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 23);
    // ETX beyond the unconditional drop threshold
    platform.set_etx(IFACE, node(3), 0xF00);

    let mut srh = rpl_packet::srh::encode(&node(2), &[node(3), node(4)], 58);
    let mut dst = node(2);
    let err = domain
        .process_srh(&mut platform, &mut srh, &mut dst, IFACE, 40)
        .unwrap_err();
    assert_eq!(err, RplError::Unreachable);
    assert_eq!(platform.icmp_errors.last(), Some(&IcmpError::SourceRouteError));
    // The rejection nudges the neighbour cache to probe
    assert_eq!(platform.probes.last(), Some(&(IFACE, node(3))));
}
