//! MRHOF parent switching with hysteresis.

mod common;

use common::{IFACE, MockPlatform, conf, dio, ll};
use rpl_core::{Domain, Policy, RplEvent};

/// Parent A offers path cost 384 (rank 256 + metric 128). A new
/// neighbour B must beat that by the switch threshold before we move.
#[test]
fn test_mrhof_hysteresis() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 7);

    // ETX 1.0 is metric 128 in RFC 6551 form
    platform.set_etx(IFACE, ll(0xA), 0x100);
    platform.set_etx(IFACE, ll(0xB), 0x100);

    domain
        .dio_received(&mut platform, &dio(256, 240, Some(conf(1))), ll(0xA), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert_eq!(
        domain.instance(1, None).unwrap().preferred_parent().unwrap().ll_address,
        ll(0xA)
    );
    platform.events.clear();

    // B at path cost 383: 383 + 192 > 384, not enough of an improvement
    domain
        .dio_received(&mut platform, &dio(255, 240, None), ll(0xB), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert_eq!(
        domain.instance(1, None).unwrap().preferred_parent().unwrap().ll_address,
        ll(0xA),
        "hysteresis must keep the current parent"
    );
    assert!(!platform.has_event(|e| matches!(e, RplEvent::ParentChanged { .. })));

    // B improves to path cost 180: 180 + 192 <= 384, switch
    domain
        .dio_received(&mut platform, &dio(52, 240, None), ll(0xB), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();
    assert_eq!(
        domain.instance(1, None).unwrap().preferred_parent().unwrap().ll_address,
        ll(0xB)
    );
    assert!(platform.has_event(|e| matches!(e, RplEvent::ParentChanged { instance_id: 1 })));
    // The parent was switched, not lost
    assert!(!platform.has_event(|e| matches!(e, RplEvent::LocalRepairStart { .. })));
}

#[test]
fn test_mrhof_rejects_bad_links() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 7);

    // Metric 640 exceeds the default threshold of 512
    platform.set_etx(IFACE, ll(0xA), 0x500);
    // Metric 256 is fine
    platform.set_etx(IFACE, ll(0xB), 0x200);

    domain
        .dio_received(&mut platform, &dio(256, 240, Some(conf(1))), ll(0xA), IFACE)
        .unwrap();
    domain
        .dio_received(&mut platform, &dio(512, 240, None), ll(0xB), IFACE)
        .unwrap();
    domain.run_parent_selection(&mut platform, 1, None).unwrap();

    // B wins despite its higher rank: A's link is over the metric limit
    let inst = domain.instance(1, None).unwrap();
    assert_eq!(inst.preferred_parent().unwrap().ll_address, ll(0xB));
}

#[test]
fn test_mrhof_parent_set_bounded() {
    let mut platform = MockPlatform::new();
    let mut domain = Domain::with_seed(Policy::default(), 7);

    domain
        .dio_received(&mut platform, &dio(256, 240, Some(conf(1))), ll(1), IFACE)
        .unwrap();
    for tail in 1..8u16 {
        platform.set_etx(IFACE, ll(tail), 0x100);
        domain
            .dio_received(&mut platform, &dio(256, 240, None), ll(tail), IFACE)
            .unwrap();
    }
    domain.run_parent_selection(&mut platform, 1, None).unwrap();

    let inst = domain.instance(1, None).unwrap();
    let parents = inst.candidates.iter().filter(|n| n.dodag_parent).count();
    assert!(parents <= 3, "parent set must respect mrhof_parent_set_size");
    assert!(parents >= 2, "equal candidates should yield backups");
}
