use mcast_rdm::ecmp::ECMP_MAX_MEMBERS;
use mcast_rdm::harness::{sim_mgr, test_config};
use mcast_rdm::node::Binding;
use mcast_rdm::rdm::RdmNode;
use mcast_rdm::{DevPort, EcmpHandle, L1Handle, McError, McMgr, Mgid, PipeMask, RdmAddr};

fn members(mgr: &McMgr, count: u16) -> Vec<L1Handle> {
    (0..count)
        .map(|i| {
            mgr.create_l1_node(0, 100 + i, &[DevPort::new(usize::from(i % 4), i % 72)], &[])
                .unwrap()
        })
        .collect()
}

fn vector_copies(mgr: &McMgr, g: EcmpHandle, pipe: usize) -> (RdmNode, RdmNode) {
    mgr.inspect(0, |d| {
        let pair = d.ecmp_group(g).unwrap().vectors[pipe];
        (d.read_rdm(pair), d.read_rdm(pair.offset(2)))
    })
    .unwrap()
}

#[test]
fn new_member_fills_the_hole() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 4);
    for &n in &nodes[..3] {
        mgr.ecmp_mbr_add(0, g, n).unwrap();
    }
    let size = mgr.inspect(0, |d| d.ecmp_group(g).unwrap().allocated_size()).unwrap();
    assert_eq!(size, 3);

    mgr.ecmp_mbr_rem(0, g, nodes[1]).unwrap();
    mgr.inspect(0, |d| {
        let grp = d.ecmp_group(g).unwrap();
        assert_eq!(grp.valid_map, 0b101);
        assert_eq!(grp.members[1], None);
        assert!(d.l1_node(nodes[1]).unwrap().binding.is_free());
    })
    .unwrap();

    mgr.ecmp_mbr_add(0, g, nodes[3]).unwrap();
    mgr.inspect(0, |d| {
        let grp = d.ecmp_group(g).unwrap();
        assert_eq!(grp.allocated_size(), 3);
        assert_eq!(grp.valid_map.count_ones(), 3);
        assert_eq!(grp.members[1], Some(nodes[3]));
        assert_eq!(
            d.l1_node(nodes[3]).unwrap().binding,
            Binding::EcmpMember { group: g, slot: 1 }
        );
        assert_eq!(d.l1_node(nodes[3]).unwrap().pipes[0].rdm_addr, grp.blocks[0].offset(2));
    })
    .unwrap();

    let expected = mgr.inspect(0, |d| d.ecmp_group(g).unwrap().vector_node(0)).unwrap();
    assert_eq!(vector_copies(&mgr, g, 0), (expected, expected));
    match expected {
        RdmNode::L1EcmpVector { length, vector, .. } => {
            assert_eq!(length, 2);
            assert_eq!(vector, 0b111);
        }
        other => panic!("unexpected vector node {:?}", other),
    }
}

#[test]
fn members_are_placed_in_every_pipe() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 2);
    for &n in &nodes {
        mgr.ecmp_mbr_add(0, g, n).unwrap();
    }
    mgr.inspect(0, |d| {
        let grp = d.ecmp_group(g).unwrap();
        for pipe in 0..4 {
            for (slot, &n) in nodes.iter().enumerate() {
                let addr = grp.blocks[pipe].offset(2 * slot as u32);
                assert_eq!(d.l1_node(n).unwrap().pipes[pipe].rdm_addr, addr);
                match d.read_rdm(addr) {
                    RdmNode::L1Rid { rid, .. } => assert_eq!(rid, 100 + slot as u16),
                    other => panic!("unexpected member node {:?}", other),
                }
            }
        }
    })
    .unwrap();
}

#[test]
fn invalid_member_operations() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let other = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 2);
    mgr.ecmp_mbr_add(0, g, nodes[0]).unwrap();

    assert!(matches!(mgr.ecmp_mbr_add(0, g, nodes[0]), Err(McError::InvalidArgument(_))));
    assert!(matches!(mgr.ecmp_mbr_add(0, other, nodes[0]), Err(McError::InvalidArgument(_))));
    assert_eq!(mgr.ecmp_mbr_rem(0, g, nodes[1]), Err(McError::NotFound));
    assert!(matches!(mgr.ecmp_mbr_add(0, EcmpHandle(40), nodes[1]), Err(McError::InvalidArgument(_))));

    mgr.create_group(0, Mgid(1)).unwrap();
    mgr.associate(0, nodes[1], Mgid(1), None).unwrap();
    assert!(matches!(mgr.ecmp_mbr_add(0, g, nodes[1]), Err(McError::InvalidArgument(_))));
}

#[test]
fn group_is_capped_at_32_members() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, ECMP_MAX_MEMBERS as u16 + 1);
    for &n in &nodes[..ECMP_MAX_MEMBERS] {
        mgr.ecmp_mbr_add(0, g, n).unwrap();
    }
    assert_eq!(mgr.ecmp_mbr_add(0, g, nodes[ECMP_MAX_MEMBERS]), Err(McError::ResourceExhausted));
    mgr.inspect(0, |d| {
        let grp = d.ecmp_group(g).unwrap();
        assert_eq!(grp.valid_map, u32::MAX);
        assert_eq!(grp.block_cap, 32);
    })
    .unwrap();
}

#[test]
fn modify_sets_exact_membership() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 5);
    mgr.ecmp_mbr_mod(0, g, &nodes[..3]).unwrap();
    mgr.ecmp_mbr_mod(0, g, &[nodes[0], nodes[3], nodes[4]]).unwrap();
    mgr.inspect(0, |d| {
        let grp = d.ecmp_group(g).unwrap();
        let mut current: Vec<L1Handle> = grp.members.iter().flatten().copied().collect();
        current.sort();
        assert_eq!(current, vec![nodes[0], nodes[3], nodes[4]]);
        assert_eq!(grp.member_count(), 3);
        for &n in &nodes[1..3] {
            let node = d.l1_node(n).unwrap();
            assert!(node.binding.is_free());
            assert!(!node.is_placed());
        }
    })
    .unwrap();
}

#[test]
fn association_links_pointer_nodes() {
    let (mgr, hw) = sim_mgr(test_config()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 2);
    mgr.ecmp_mbr_mod(0, g, &nodes).unwrap();
    let mgid = Mgid(20);
    mgr.create_group(0, mgid).unwrap();
    assert_eq!(mgr.ecmp_associate(0, g, Mgid(21), None), Err(McError::NotFound));
    mgr.ecmp_associate(0, g, mgid, Some(7)).unwrap();
    assert_eq!(mgr.ecmp_associate(0, g, mgid, None), Err(McError::AlreadyExists));

    mgr.inspect(0, |d| {
        assert_eq!(d.group_member_count(mgid).unwrap(), 1);
        assert_eq!(d.group(mgid).unwrap().pvt, PipeMask(0b1111));
        let grp = d.ecmp_group(g).unwrap();
        for pipe in 0..4 {
            let walk = d.walk_tree(pipe, mgid).unwrap();
            assert_eq!(walk.len(), 1);
            assert_eq!(
                walk[0].1,
                RdmNode::L1EcmpPtrXid {
                    next_l1: d.tails().node(0, pipe),
                    vector0: grp.vectors[pipe],
                    vector1: grp.vectors[pipe].offset(2),
                    xid: 7,
                }
            );
        }
    })
    .unwrap();

    mgr.ecmp_dissociate(0, g, mgid).unwrap();
    assert_eq!(mgr.ecmp_dissociate(0, g, mgid), Err(McError::NotFound));
    mgr.inspect(0, |d| {
        assert_eq!(d.group_member_count(mgid).unwrap(), 0);
        assert!(d.ecmp_group(g).unwrap().pointers.is_empty());
    })
    .unwrap();
    assert_eq!(hw.state().mit.get(&(0, mgid)), Some(&RdmAddr::NULL));
}

#[test]
fn destroy_releases_everything() {
    let (mgr, _hw) = sim_mgr(test_config()).unwrap();
    let free_before = mgr.inspect(0, |d| d.free_blocks()).unwrap();
    let g = mgr.create_ecmp_group(0).unwrap();
    let nodes = members(&mgr, 3);
    mgr.ecmp_mbr_mod(0, g, &nodes).unwrap();
    mgr.create_group(0, Mgid(2)).unwrap();
    mgr.ecmp_associate(0, g, Mgid(2), None).unwrap();

    mgr.destroy_ecmp_group(0, g).unwrap();
    mgr.inspect(0, |d| {
        assert!(d.ecmp_group(g).is_err());
        assert_eq!(d.group_member_count(Mgid(2)).unwrap(), 0);
        for &n in &nodes {
            assert!(d.l1_node(n).unwrap().binding.is_free());
        }
        assert_eq!(d.free_blocks(), free_before);
        d.check_allocator().unwrap();
    })
    .unwrap();
    for &n in &nodes {
        mgr.destroy_l1_node(0, n).unwrap();
    }
    let again = mgr.create_ecmp_group(0).unwrap();
    let hw_id = mgr.inspect(0, |d| d.ecmp_group(again).unwrap().hw_id).unwrap();
    assert_eq!(hw_id, 0);
}
