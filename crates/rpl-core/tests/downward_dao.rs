//! DAO target publication, acknowledgement and retry behaviour.

mod common;

use common::{IFACE, MockPlatform, conf, dio, dodag_id, ll};
use ipnet::Ipv6Net;
use rpl_core::{Domain, Policy, RouteSource};
use rpl_packet::DaoAckMessage;
use rpl_packet::messages::{DaoGroup, DaoMessage, DaoTargetOption, Mop, TransitOption, g_mop_prf};
use std::net::Ipv6Addr;

fn target_prefix() -> Ipv6Net {
    "2001:db8::abcd/128".parse().unwrap()
}

fn joined_domain(platform: &mut MockPlatform, policy: Policy) -> Domain {
    let mut domain = Domain::with_seed(policy, 11);
    platform.set_etx(IFACE, ll(1), 0x100);
    domain
        .dio_received(platform, &dio(256, 240, Some(conf(0))), ll(1), IFACE)
        .unwrap();
    domain.run_parent_selection(platform, 1, None).unwrap();
    domain
}

#[test]
fn test_dao_ack_timeout_and_failure() {
    let mut platform = MockPlatform::new();
    let mut policy = Policy::default();
    policy.dao_retry_count = 2;
    // Neighbour cache retransmission timer 4000 ms: wait = 80 ticks
    platform.retrans_timer_ms = Some(4000);

    let mut domain = joined_domain(&mut platform, policy);
    let dtsn_before = domain.instance(1, None).unwrap().dtsn;

    domain
        .publish_dao_target(1, None, target_prefix(), 0xFFFF_FFFF, true, None)
        .unwrap();

    // The DAO leaves after the short scheduling delay
    domain.fast_tick(&mut platform, 10);
    assert_eq!(platform.daos.len(), 1);
    let first_seq = platform.daos[0].2.sequence;
    // Non-storing: the DAO goes to the root
    assert_eq!(platform.daos[0].1, dodag_id());

    // No ACK: retransmit at 80 and 160 ticks with the same sequence
    domain.fast_tick(&mut platform, 80);
    assert_eq!(platform.daos.len(), 2);
    domain.fast_tick(&mut platform, 80);
    assert_eq!(platform.daos.len(), 3);
    assert!(platform.daos.iter().all(|(_, _, d)| d.sequence == first_seq));

    // Third timeout: give up, bump DTSN so children refresh
    domain.fast_tick(&mut platform, 80);
    assert_eq!(platform.daos.len(), 3, "no transmission after failure");
    let inst = domain.instance(1, None).unwrap();
    assert!(!inst.dao_in_transit);
    assert_ne!(inst.dtsn, dtsn_before);
    assert_eq!(domain.stats.dao_failures, 1);
}

#[test]
fn test_dao_ack_assigns_path_control() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());

    domain
        .publish_dao_target(1, None, target_prefix(), 0xFFFF_FFFF, true, None)
        .unwrap();
    domain.fast_tick(&mut platform, 10);
    let (_, _, dao) = platform.daos.last().unwrap();
    let sequence = dao.sequence;
    let advertised: u8 = dao.groups[0].transits.iter().fold(0, |a, t| a | t.path_control);
    assert_ne!(advertised, 0);

    domain
        .dao_ack_received(
            &mut platform,
            &DaoAckMessage { instance_id: 1, sequence, status: 0, dodag_id: None },
            ll(1),
            IFACE,
        )
        .unwrap();

    let inst = domain.instance(1, None).unwrap();
    assert!(!inst.dao_in_transit);
    let info = inst.targets[0].non_root().unwrap();
    // Assigned bits never exceed what was advertised
    assert_eq!(info.pc_assigned & !advertised, 0);
    assert_ne!(info.pc_assigned, 0);
    assert_eq!(info.pc_assigning, 0);
}

#[test]
fn test_failed_ack_schedules_retry() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());

    domain
        .publish_dao_target(1, None, target_prefix(), 0xFFFF_FFFF, true, None)
        .unwrap();
    domain.fast_tick(&mut platform, 10);
    let sequence = platform.daos.last().unwrap().2.sequence;

    domain
        .dao_ack_received(
            &mut platform,
            &DaoAckMessage { instance_id: 1, sequence, status: 130, dodag_id: None },
            ll(1),
            IFACE,
        )
        .unwrap();

    let inst = domain.instance(1, None).unwrap();
    let info = inst.targets[0].non_root().unwrap();
    assert_ne!(info.pc_to_retry, 0);
    assert_eq!(info.pc_assigned, 0);
    // A fresh DAO is pending
    assert_ne!(inst.delay_dao_timer, 0);
}

#[test]
fn test_deleting_target_sends_no_path() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());

    domain
        .publish_dao_target(1, None, target_prefix(), 0xFFFF_FFFF, true, None)
        .unwrap();
    domain.fast_tick(&mut platform, 10);
    let sequence = platform.daos.last().unwrap().2.sequence;
    domain
        .dao_ack_received(
            &mut platform,
            &DaoAckMessage { instance_id: 1, sequence, status: 0, dodag_id: None },
            ll(1),
            IFACE,
        )
        .unwrap();
    platform.daos.clear();

    domain.delete_dao_target(1, None, &target_prefix()).unwrap();
    domain.fast_tick(&mut platform, 10);

    let (_, _, dao) = platform.daos.last().expect("No-Path DAO");
    let no_path = dao
        .groups
        .iter()
        .any(|g| g.transits.iter().all(|t| t.path_lifetime == 0));
    assert!(no_path, "withdrawal must carry zero path lifetime");
}

#[test]
fn test_storing_node_installs_dao_route() -> anyhow::Result<()> {
    common::init_tracing();
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 11);
    platform.set_etx(IFACE, ll(1), 0x100);
    // Storing-mode DODAG (MOP 2)
    let mut d = dio(256, 240, Some(conf(0)));
    d.g_mop_prf = g_mop_prf(true, Mop::Storing, 0);
    domain.dio_received(&mut platform, &d, ll(1), IFACE)?;
    domain.run_parent_selection(&mut platform, 1, None)?;

    let child: Ipv6Addr = "2001:db8::99".parse().unwrap();
    let dao = DaoMessage {
        instance_id: 1,
        expect_ack: true,
        sequence: 241,
        dodag_id: None,
        groups: vec![DaoGroup {
            targets: vec![DaoTargetOption { prefix: child, prefix_len: 128, descriptor: None }],
            transits: vec![TransitOption {
                external: false,
                path_control: 0x80,
                path_sequence: 240,
                path_lifetime: 30,
                parent_address: None,
            }],
        }],
    };
    domain.dao_received(&mut platform, &dao, ll(7), IFACE)?;

    // Route towards the child through the DAO sender, and an ACK back
    let routes = platform.routes_with_source(RouteSource::RplDao);
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].next_hop, Some(ll(7)));
    assert_eq!(routes[0].prefix.addr(), child);
    let (_, dst, ack) = platform.dao_acks.last().expect("DAO-ACK sent");
    assert_eq!(*dst, ll(7));
    assert_eq!(ack.sequence, 241);
    assert_eq!(ack.status, 0);

    // A No-Path DAO withdraws the route again
    let mut no_path = dao.clone();
    no_path.sequence = 242;
    no_path.groups[0].transits[0].path_lifetime = 0;
    domain.dao_received(&mut platform, &no_path, ll(7), IFACE)?;
    assert!(platform.routes_with_source(RouteSource::RplDao).is_empty());
    Ok(())
}

#[test]
fn test_dao_idempotent_for_route_table() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 11);
    platform.set_etx(IFACE, ll(1), 0x100);
    let mut d = dio(256, 240, Some(conf(0)));
    d.g_mop_prf = g_mop_prf(true, Mop::Storing, 0);
    domain.dio_received(&mut platform, &d, ll(1), IFACE).unwrap();

    let child: Ipv6Addr = "2001:db8::99".parse().unwrap();
    let dao = DaoMessage {
        instance_id: 1,
        expect_ack: false,
        sequence: 241,
        dodag_id: None,
        groups: vec![DaoGroup {
            targets: vec![DaoTargetOption { prefix: child, prefix_len: 128, descriptor: None }],
            transits: vec![TransitOption {
                external: false,
                path_control: 0x80,
                path_sequence: 240,
                path_lifetime: 30,
                parent_address: None,
            }],
        }],
    };
    domain.dao_received(&mut platform, &dao, ll(7), IFACE).unwrap();
    let routes_before = platform.routes.clone();
    let targets_before = domain.instance(1, None).unwrap().targets.clone();

    domain.dao_received(&mut platform, &dao, ll(7), IFACE).unwrap();
    assert_eq!(platform.routes, routes_before);
    assert_eq!(domain.instance(1, None).unwrap().targets, targets_before);
}
