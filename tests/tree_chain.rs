//! Group trees and L2 chains as the hardware walks them.

use std::collections::BTreeSet;

use mcast_rdm::harness::{sim_mgr, test_config, SimHw};
use mcast_rdm::rdm::RdmNode;
use mcast_rdm::types::NodeClass;
use mcast_rdm::{DevPort, L1Handle, McError, McMgr, Mgid, PipeMask, RdmAddr};
use proptest::prelude::*;

/// Release held completions until the device stops issuing RDM changes.
fn drain_epochs(mgr: &McMgr, hw: &SimHw) {
    while hw.release_completions() > 0 {
        mgr.service_completions().unwrap();
    }
}

#[test]
fn single_node_group_walks_to_its_node() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(10);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr
        .create_l1_node(0, 5, &[DevPort::new(0, 3), DevPort::new(0, 7)], &[])
        .unwrap();
    mgr.associate(0, node, mgid, None).unwrap();

    mgr.inspect(0, |d| {
        assert_eq!(d.group_member_count(mgid).unwrap(), 1);
        let walk = d.walk_tree(0, mgid).unwrap();
        assert_eq!(walk.len(), 1);
        match walk[0].1 {
            RdmNode::L1Rid { rid, next_l1, .. } => {
                assert_eq!(rid, 5);
                assert_eq!(next_l1, d.tails().node(0, 0));
            }
            other => panic!("unexpected l1 node {:?}", other),
        }
        let l2: Vec<RdmNode> = d.walk_l2(walk[0].0).into_iter().map(|(_, n)| n).collect();
        assert_eq!(
            l2,
            vec![RdmNode::L2Port18 { last: true, pipe: 0, index: 0, ports: (1 << 3) | (1 << 7) }]
        );
        for pipe in 1..4 {
            assert!(d.walk_tree(pipe, mgid).unwrap().is_empty());
        }
        assert_eq!(d.group(mgid).unwrap().pvt, PipeMask(0b0001));
        assert_eq!(hw.state().mit.get(&(0, mgid)), Some(&walk[0].0));
    })
    .unwrap();
}

#[test]
fn association_state_errors() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let (a, b) = (Mgid(1), Mgid(2));
    mgr.create_group(0, a).unwrap();
    mgr.create_group(0, b).unwrap();
    assert_eq!(mgr.create_group(0, a), Err(McError::AlreadyExists));
    let node = mgr.create_l1_node(0, 9, &[DevPort::new(1, 1)], &[]).unwrap();

    assert_eq!(mgr.associate(0, node, Mgid(3), None), Err(McError::NotFound));
    mgr.associate(0, node, a, Some(44)).unwrap();
    assert_eq!(mgr.associate(0, node, b, None), Err(McError::AlreadyExists));
    assert_eq!(mgr.dissociate(0, node, b), Err(McError::NotFound));
    assert_eq!(mgr.destroy_l1_node(0, node), Err(McError::InUse));
    assert!(matches!(
        mgr.create_l1_node(0, 1, &[DevPort::new(0, 80)], &[]),
        Err(McError::InvalidArgument(_))
    ));

    mgr.dissociate(0, node, a).unwrap();
    mgr.destroy_l1_node(0, node).unwrap();
    assert!(matches!(mgr.dissociate(0, node, a), Err(McError::InvalidArgument(_))));
}

#[test]
fn xid_nodes_and_head_insertion() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(7);
    mgr.create_group(0, mgid).unwrap();
    let first = mgr.create_l1_node(0, 1, &[DevPort::new(2, 4)], &[]).unwrap();
    let second = mgr.create_l1_node(0, 2, &[DevPort::new(2, 40)], &[]).unwrap();
    mgr.associate(0, first, mgid, None).unwrap();
    mgr.associate(0, second, mgid, Some(12)).unwrap();

    mgr.inspect(0, |d| {
        let walk = d.walk_tree(2, mgid).unwrap();
        let rids: Vec<u16> = walk
            .iter()
            .map(|(_, n)| match *n {
                RdmNode::L1Rid { rid, .. } => rid,
                RdmNode::L1Xid { rid, xid, .. } => {
                    assert_eq!(xid, 12);
                    rid
                }
                other => panic!("unexpected l1 node {:?}", other),
            })
            .collect();
        assert_eq!(rids, vec![2, 1]);
        let last = walk[1].1.next_l1().unwrap();
        assert_eq!(last, d.tails().node(0, 2));
    })
    .unwrap();
}

#[test]
fn tail_waits_for_epoch_completion() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(3);
    mgr.create_group(0, mgid).unwrap();
    hw.set_auto_complete(false);
    let node = mgr.create_l1_node(0, 5, &[DevPort::new(0, 3)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();

    mgr.inspect(0, |d| {
        let walk = d.walk_tree(0, mgid).unwrap();
        assert_eq!(walk[0].1.next_l1(), Some(RdmAddr::NULL));
        assert_eq!(d.epoch_counts(0), (1, 0));
        assert_eq!(d.group(mgid).unwrap().trees[0].tail_bucket, None);
    })
    .unwrap();

    drain_epochs(&mgr, &hw);
    mgr.inspect(0, |d| {
        let walk = d.walk_tree(0, mgid).unwrap();
        assert_eq!(walk[0].1.next_l1(), Some(d.tails().node(0, 0)));
        assert_eq!(d.group(mgid).unwrap().trees[0].tail_bucket, Some(0));
        assert_eq!(d.epoch_counts(0), (1, 1));
    })
    .unwrap();
}

#[test]
fn dissociated_memory_waits_for_epoch() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(4);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr.create_l1_node(0, 5, &[DevPort::new(1, 3)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    let slot = mgr.inspect(0, |d| d.l1_node(node).unwrap().pipes[1].rdm_addr).unwrap();

    hw.set_auto_complete(false);
    mgr.dissociate(0, node, mgid).unwrap();
    let other = mgr.create_l1_node(0, 6, &[DevPort::new(1, 9)], &[]).unwrap();
    mgr.associate(0, other, mgid, None).unwrap();
    mgr.inspect(0, |d| {
        assert_ne!(d.l1_node(other).unwrap().pipes[1].rdm_addr, slot);
        assert!(!d.l1_node(node).unwrap().is_placed());
        assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 2);
    })
    .unwrap();

    drain_epochs(&mgr, &hw);
    mgr.inspect(0, |d| {
        assert_eq!(d.rdm_usage(1, NodeClass::L2).runs, 1);
        assert_eq!(d.read_rdm(slot), RdmNode::Invalid);
        d.check_allocator().unwrap();
    })
    .unwrap();
}

#[test]
fn node_update_moves_placements() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(5);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr.create_l1_node(0, 5, &[DevPort::new(0, 1)], &[]).unwrap();
    mgr.associate(0, node, mgid, None).unwrap();
    mgr.node_update(0, node, &[DevPort::new(0, 1), DevPort::new(0, 60), DevPort::new(3, 2)], &[])
        .unwrap();

    mgr.inspect(0, |d| {
        let walk = d.walk_tree(0, mgid).unwrap();
        let l2: Vec<RdmNode> = d.walk_l2(walk[0].0).into_iter().map(|(_, n)| n).collect();
        assert_eq!(
            l2,
            vec![RdmNode::L2Port72 { last: true, pipe: 0, ports: (1 << 1) | (1 << 60) }]
        );
        assert_eq!(d.walk_tree(3, mgid).unwrap().len(), 1);
        assert_eq!(d.group(mgid).unwrap().pvt, PipeMask(0b1001));
    })
    .unwrap();

    mgr.node_update(0, node, &[DevPort::new(3, 2)], &[]).unwrap();
    mgr.inspect(0, |d| {
        assert!(d.walk_tree(0, mgid).unwrap().is_empty());
        assert_eq!(d.group(mgid).unwrap().pvt, PipeMask(0b1000));
    })
    .unwrap();
}

#[test]
fn split_moves_pipes_to_a_new_node() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(6);
    mgr.create_group(0, mgid).unwrap();
    let node = mgr
        .create_l1_node(0, 8, &[DevPort::new(0, 1), DevPort::new(2, 1)], &[])
        .unwrap();
    mgr.associate(0, node, mgid, Some(3)).unwrap();
    assert_eq!(mgr.split(0, node, PipeMask(0)), Ok(None));

    let moved = mgr.split(0, node, PipeMask(0b0100)).unwrap().unwrap();
    mgr.inspect(0, |d| {
        assert_eq!(d.group_member_count(mgid).unwrap(), 2);
        let kept = d.l1_node(node).unwrap();
        let other = d.l1_node(moved).unwrap();
        assert!(kept.pipes[0].is_placed() && !kept.pipes[2].is_placed());
        assert!(other.pipes[2].is_placed() && !other.pipes[0].is_placed());
        assert_eq!((other.rid, other.xid), (8, Some(3)));
        assert_eq!(d.walk_tree(2, mgid).unwrap()[0].0, other.pipes[2].rdm_addr);
    })
    .unwrap();
}

#[test]
fn destroy_group_dissociates_members() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let mgid = Mgid(8);
    mgr.create_group(0, mgid).unwrap();
    let nodes: Vec<L1Handle> = (0..3)
        .map(|i| mgr.create_l1_node(0, i, &[DevPort::new(i as usize, 2)], &[]).unwrap())
        .collect();
    for &n in &nodes {
        mgr.associate(0, n, mgid, None).unwrap();
    }
    mgr.destroy_group(0, mgid).unwrap();
    mgr.inspect(0, |d| {
        assert_eq!(d.group(mgid).err(), Some(McError::NotFound));
        for &n in &nodes {
            assert!(!d.l1_node(n).unwrap().is_placed());
        }
    })
    .unwrap();
    for &n in &nodes {
        mgr.destroy_l1_node(0, n).unwrap();
    }
}

#[derive(Debug, Clone)]
enum Op {
    Associate(usize, usize),
    Dissociate(usize),
    Update(usize, Vec<(usize, u16)>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..6usize, 0..3usize).prop_map(|(n, g)| Op::Associate(n, g)),
        (0..6usize).prop_map(Op::Dissociate),
        (0..6usize, prop::collection::vec((0..4usize, 0..72u16), 0..4)).prop_map(|(n, p)| Op::Update(n, p)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn walks_visit_exactly_the_placed_members(ops in prop::collection::vec(op(), 1..40)) {
        let (mgr, _hw) = sim_mgr(test_config()).unwrap();
        let groups: Vec<Mgid> = (0..3).map(|i| Mgid(100 + i)).collect();
        for &g in &groups {
            mgr.create_group(0, g).unwrap();
        }
        let nodes: Vec<L1Handle> = (0..6)
            .map(|i| mgr.create_l1_node(0, i as u16, &[DevPort::new(i % 4, i as u16)], &[]).unwrap())
            .collect();
        let mut bound: Vec<Option<usize>> = vec![None; nodes.len()];

        for op in ops {
            match op {
                Op::Associate(n, g) => {
                    let res = mgr.associate(0, nodes[n], groups[g], None);
                    if bound[n].is_some() {
                        prop_assert_eq!(res, Err(McError::AlreadyExists));
                    } else {
                        prop_assert_eq!(res, Ok(()));
                        bound[n] = Some(g);
                    }
                }
                Op::Dissociate(n) => {
                    if let Some(g) = bound[n].take() {
                        prop_assert_eq!(mgr.dissociate(0, nodes[n], groups[g]), Ok(()));
                    }
                }
                Op::Update(n, ports) => {
                    let ports: Vec<DevPort> = ports.iter().map(|&(p, l)| DevPort::new(p, l)).collect();
                    prop_assert_eq!(mgr.node_update(0, nodes[n], &ports, &[]), Ok(()));
                }
            }

            mgr.inspect(0, |d| {
                d.check_allocator().unwrap();
                for (gi, &g) in groups.iter().enumerate() {
                    let members: BTreeSet<L1Handle> = nodes
                        .iter()
                        .zip(&bound)
                        .filter(|(_, b)| **b == Some(gi))
                        .map(|(&h, _)| h)
                        .collect();
                    assert_eq!(d.group(g).unwrap().members, members);
                    for pipe in 0..4 {
                        let walk: Vec<RdmAddr> = d.walk_tree(pipe, g).unwrap().into_iter().map(|(a, _)| a).collect();
                        let unique: BTreeSet<RdmAddr> = walk.iter().copied().collect();
                        assert_eq!(unique.len(), walk.len());
                        let expected: BTreeSet<RdmAddr> = members
                            .iter()
                            .map(|&h| d.l1_node(h).unwrap())
                            .filter(|n| n.ports.pipes().contains(pipe))
                            .map(|n| n.pipes[pipe].rdm_addr)
                            .collect();
                        assert_eq!(unique, expected);
                        assert!(!expected.contains(&RdmAddr::NULL));
                    }
                }
            })
            .unwrap();
        }
    }
}
