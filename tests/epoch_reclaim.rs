//! Deferred frees and RDM-change epochs, end to end.

use mcast_rdm::harness::{sim_mgr, test_config, SimHw};
use mcast_rdm::rdm::RdmNode;
use mcast_rdm::types::NodeClass;
use mcast_rdm::{DevPort, L1Handle, McError, McMgr, Mgid};

fn release_once(mgr: &McMgr, hw: &SimHw) -> usize {
    let released = hw.release_completions();
    mgr.service_completions().unwrap();
    released
}

#[test]
fn frees_during_an_epoch_wait_for_the_next() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    hw.set_auto_complete(false);
    let free_blocks = mgr.inspect(0, |d| d.free_blocks()).unwrap();
    let mgid = Mgid(8);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr.create_l1_node(0, 1, &[DevPort::new(1, 3)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    let l2 = mgr
        .inspect(0, |d| d.l1_node(node).unwrap().pipes[1].l2.head())
        .unwrap();
    assert_eq!(mgr.inspect(0, |d| d.epoch_counts(1)).unwrap(), (1, 0));

    mgr.dissociate(0, node, mgid).unwrap();
    mgr.inspect(0, |d| {
        assert_eq!(d.epoch_counts(1), (1, 0));
        assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 1);
    })
    .unwrap();

    // The first epoch only carried the tail rewrite; it restarts for the free.
    assert_eq!(release_once(&mgr, &hw), 1);
    mgr.inspect(0, |d| {
        assert_eq!(d.epoch_counts(1), (2, 1));
        assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 1);
        assert_ne!(d.read_rdm(l2), RdmNode::Invalid);
    })
    .unwrap();

    assert_eq!(release_once(&mgr, &hw), 1);
    mgr.inspect(0, |d| {
        assert_eq!(d.epoch_counts(1), (2, 2));
        assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 0);
        assert_eq!(d.rdm_usage(1, NodeClass::L2).blocks, 0);
        assert_eq!(d.read_rdm(l2), RdmNode::Invalid);
        assert_eq!(d.free_blocks(), free_blocks);
        d.check_allocator().unwrap();
    })
    .unwrap();
    assert_eq!(release_once(&mgr, &hw), 0);
}

#[test]
fn idle_pipes_issue_no_rdm_change() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(9);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr.create_l1_node(0, 1, &[DevPort::new(2, 3)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    let state = hw.state();
    assert_eq!(state.rdm_changes.get(&2), Some(&1));
    assert!(state.rdm_changes.get(&0).is_none());
    assert!(state.rdm_changes.get(&3).is_none());
}

#[test]
fn spurious_completion_is_ignored() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    mgr.rdm_change_done(0, 2, true).unwrap();
    assert_eq!(mgr.inspect(0, |d| d.epoch_counts(2)).unwrap(), (0, 0));
    assert!(matches!(mgr.rdm_change_done(0, 9, true), Err(McError::InvalidArgument(_))));
    assert!(matches!(mgr.rdm_change_done(3, 0, false), Err(McError::InvalidArgument(_))));
}

#[test]
fn only_restartable_completions_start_the_next_epoch() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    hw.set_auto_complete(false);
    let mgid = Mgid(12);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr
        .create_l1_node(0, 4, &[DevPort::new(1, 3), DevPort::new(2, 3)], &[])
        .unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    mgr.dissociate(0, node, mgid).unwrap();
    mgr.inspect(0, |d| {
        assert_eq!(d.epoch_counts(1), (1, 0));
        assert_eq!(d.epoch_counts(2), (1, 0));
    })
    .unwrap();
    // Completions are delivered by hand below.
    hw.state().held.clear();

    let mut batch = mgr.begin_batch();
    let d = batch.device(0).unwrap();
    d.epoch_complete(1, false).unwrap();
    d.epoch_complete(2, true).unwrap();
    assert_eq!(d.epoch_counts(1), (1, 1));
    assert_eq!(d.epoch_counts(2), (2, 1));
    assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 1);
    assert_eq!(hw.state().rdm_changes.get(&1), Some(&1));
    assert_eq!(hw.state().rdm_changes.get(&2), Some(&2));
    // Committing ends the operation, which restarts the idle pipe.
    batch.commit().unwrap();
    assert_eq!(mgr.inspect(0, |d| d.epoch_counts(1)).unwrap(), (2, 1));
    assert_eq!(hw.state().rdm_changes.get(&1), Some(&2));
}

#[test]
fn queued_completion_carries_the_restart_flag() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    hw.set_auto_complete(false);
    let mgid = Mgid(13);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr.create_l1_node(0, 5, &[DevPort::new(3, 1)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    mgr.dissociate(0, node, mgid).unwrap();

    let mut batch = mgr.begin_batch();
    let d = batch.device(0).unwrap();
    assert_eq!(hw.release_completions_as(false), 1);
    assert_eq!(d.service_completions().unwrap(), 1);
    assert_eq!(d.epoch_counts(3), (1, 1));
    assert_eq!(d.rdm_usage(3, NodeClass::L2).runs, 1);
    batch.commit().unwrap();

    assert_eq!(mgr.inspect(0, |d| d.epoch_counts(3)).unwrap(), (2, 1));
    while release_once(&mgr, &hw) > 0 {}
    mgr.inspect(0, |d| {
        assert_eq!(d.rdm_usage(3, NodeClass::L2).runs, 0);
        d.check_allocator().unwrap();
    })
    .unwrap();
}

#[test]
fn exhaustion_inside_a_batch_collects_garbage() {
    let cfg = test_config().with_pipes(1).with_rdm(256, 64);
    let (mgr, _hw) = sim_mgr(cfg).unwrap();
    let mgid = Mgid(1);
    mgr.create_group(0, mgid).unwrap();

    let mut placed: Vec<L1Handle> = Vec::new();
    let spare = loop {
        let i = placed.len() as u16;
        let node = mgr.create_l1_node(0, i, &[DevPort::new(0, i % 72)], &[]).unwrap();
        match mgr.associate(0, node, mgid, None) {
            Ok(()) => placed.push(node),
            Err(McError::ResourceExhausted) => break node,
            Err(e) => panic!("unexpected error {:?}", e),
        }
        assert!(placed.len() < 256, "rdm never filled up");
    };
    assert!(!placed.is_empty());

    let mut batch = mgr.begin_batch();
    let d = batch.device(0).unwrap();
    for &node in &placed {
        d.dissociate(node, mgid).unwrap();
    }
    let started = d.epoch_counts(0).0;
    assert_eq!(d.rdm_usage(0, NodeClass::L2).runs, placed.len());
    d.associate(spare, mgid, None).unwrap();
    assert!(d.epoch_counts(0).0 > started);
    assert_eq!(d.rdm_usage(0, NodeClass::L2).runs, 1);
    batch.commit().unwrap();

    mgr.inspect(0, |d| {
        assert_eq!(d.walk_tree(0, mgid).unwrap().len(), 1);
        d.check_allocator().unwrap();
    })
    .unwrap();
}

#[test]
fn destroyed_group_memory_is_reclaimed() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let before = mgr.inspect(0, |d| d.free_blocks()).unwrap();
    let mgid = Mgid(77);
    mgr.create_group(0, mgid).unwrap();
    for i in 0..6u16 {
        let node = mgr
            .create_l1_node(0, i, &[DevPort::new(usize::from(i % 4), i)], &[])
            .unwrap();
        mgr.associate(0, node, mgid, None).unwrap();
    }
    hw.set_auto_complete(false);
    mgr.destroy_group(0, mgid).unwrap();
    assert!(mgr.inspect(0, |d| d.free_blocks()).unwrap() < before);

    while release_once(&mgr, &hw) > 0 {}
    mgr.inspect(0, |d| {
        assert_eq!(d.free_blocks(), before);
        assert!(matches!(d.group(mgid), Err(McError::NotFound)));
        d.check_allocator().unwrap();
    })
    .unwrap();
}
