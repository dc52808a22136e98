//! Local repair, version migration and the timer-driven paths.

mod common;

use common::{IFACE, MockPlatform, conf, dio, dodag_id, ll};
use rpl_core::{Domain, Policy, RplEvent};

fn joined_domain(platform: &mut MockPlatform, policy: Policy) -> Domain {
    let mut domain = Domain::with_seed(policy, 31);
    platform.set_etx(IFACE, ll(1), 0x100);
    domain
        .dio_received(platform, &dio(256, 240, Some(conf(0))), ll(1), IFACE)
        .unwrap();
    domain.run_parent_selection(platform, 1, None).unwrap();
    domain
}

#[test]
fn test_repair_dis_backoff_and_give_up() {
    let mut platform = MockPlatform::new();
    let mut policy = Policy::default();
    policy.repair_initial_dis_delay_s = 1;
    policy.repair_maximum_dis_interval_s = 4;
    policy.repair_dis_count = 3;
    let mut domain = joined_domain(&mut platform, policy);

    // Lose the only parent
    platform.set_etx(IFACE, ll(1), 0xFFFF);
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert!(platform.has_event(|e| matches!(e, RplEvent::LocalRepairStart { instance_id: 1 })));
    platform.diss.clear();

    // DIS at 1 s, then doubled to 2 s, then capped at 4 s
    domain.slow_tick(&mut platform, 1);
    assert_eq!(platform.diss.len(), 1);
    domain.slow_tick(&mut platform, 2);
    assert_eq!(platform.diss.len(), 2);
    domain.slow_tick(&mut platform, 4);
    assert_eq!(platform.diss.len(), 3);
    assert!(platform.has_event(|e| matches!(e, RplEvent::LocalRepairNoMoreDis { instance_id: 1 })));

    // No further solicitation once the budget is spent
    domain.slow_tick(&mut platform, 60);
    assert_eq!(platform.diss.len(), 3);
    assert!(domain.stats.time_no_next_hop >= 7);
}

#[test]
fn test_repair_ends_on_new_parent() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());
    platform.set_etx(IFACE, ll(1), 0xFFFF);
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert!(domain.instance(1, None).unwrap().local_repair);

    // A new neighbour appears and is selected
    platform.set_etx(IFACE, ll(2), 0x100);
    domain
        .dio_received(&mut platform, &dio(512, 240, None), ll(2), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();

    let inst = domain.instance(1, None).unwrap();
    assert!(!inst.local_repair);
    assert_eq!(inst.preferred_parent().unwrap().ll_address, ll(2));
}

#[test]
fn test_version_upgrade_migrates_and_prunes() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());
    assert_eq!(domain.stats.global_repairs, 0);

    // The parent moves to version 241
    domain
        .dio_received(&mut platform, &dio(256, 241, None), ll(1), IFACE)
        .unwrap();
    assert_eq!(domain.stats.global_repairs, 1);
    domain.run_parent_selection(&mut platform, 1, None).unwrap();

    let inst = domain.instance(1, None).unwrap();
    assert_eq!(inst.current.unwrap().number, 241);
    // The old version has no members left and is retired
    let dodag = inst.dodag(&dodag_id()).unwrap();
    assert!(dodag.version(241).is_some());
    assert!(dodag.version(240).is_none());
}

#[test]
fn test_delayed_parent_selection_via_slow_tick() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 31);
    platform.set_etx(IFACE, ll(1), 0x100);
    domain
        .dio_received(&mut platform, &dio(256, 240, Some(conf(0))), ll(1), IFACE)
        .unwrap();

    // Ingestion only schedules selection; the slow timer runs it
    assert!(domain.instance(1, None).unwrap().preferred_parent().is_none());
    // Delay is 15 s with up to 20% jitter
    domain.slow_tick(&mut platform, 20);
    let inst = domain.instance(1, None).unwrap();
    assert!(inst.preferred_parent().is_some());
    assert_eq!(inst.current_rank, 512);
}

#[test]
fn test_purge_reclaims_one_item_at_a_time() {
    let mut platform = MockPlatform::new();
    let mut domain = joined_domain(&mut platform, Policy::default());
    // A considered non-parent candidate with a poor link
    platform.set_etx(IFACE, ll(9), 0x400);
    domain
        .dio_received(&mut platform, &dio(768, 240, None), ll(9), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert_eq!(domain.instance(1, None).unwrap().candidates.len(), 2);

    assert!(domain.purge(&mut platform), "one candidate reclaimed");
    assert_eq!(domain.instance(1, None).unwrap().candidates.len(), 1);
    // The parent is never purged
    assert!(!domain.purge(&mut platform));
    assert_eq!(domain.instance(1, None).unwrap().candidates.len(), 1);
}

#[test]
fn test_root_is_quiet_about_its_own_dodag() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 31);
    domain
        .create_root_dodag(
            1,
            dodag_id(),
            rpl_packet::messages::g_mop_prf(true, rpl_packet::Mop::NonStoring, 0),
            conf(0),
        )
        .unwrap();

    // Echo of our own DODAG from a would-be child: ignored entirely
    domain
        .dio_received(&mut platform, &dio(512, 240, None), ll(4), IFACE)
        .unwrap();
    let inst = domain.instance(1, None).unwrap();
    assert!(inst.candidates.is_empty());
    assert!(inst.am_root());
    // As root we advertise ROOT_RANK = MinHopRankIncrease
    assert_eq!(inst.current_rank, 256);

    // Trickle still advertises the DODAG
    for _ in 0..4 {
        domain.fast_tick(&mut platform, 1);
    }
    assert!(!platform.dios.is_empty());
    assert_eq!(platform.dios.last().unwrap().2.rank, 256);
}

#[test]
fn test_root_version_bump_counts_global_repair() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 31);
    domain
        .create_root_dodag(
            1,
            dodag_id(),
            rpl_packet::messages::g_mop_prf(true, rpl_packet::Mop::NonStoring, 0),
            conf(0),
        )
        .unwrap();
    let before = domain.dodag_info(1, None).unwrap().version;
    domain.bump_root_version(1, &dodag_id()).unwrap();
    let after = domain.dodag_info(1, None).unwrap().version;
    assert_ne!(before, after);
    assert_eq!(domain.stats.global_repairs, 1);
    let _ = platform;
}
