#![forbid(unsafe_code)]

//! Tiered replica placement and the freshness of directory replicas as the
//! namespace changes underneath them.

use dfs_fs::{DittoPolicy, FsOptions};
use dfs_harness::{Workbench, nested_dirs, patterned};
use dfs_types::InodeNumber;

fn replica_count(mgr: &dfs_ditto::DittoManager, inum: InodeNumber) -> usize {
    mgr.fs()
        .read_record(inum)
        .expect("record")
        .children()
        .iter()
        .filter(|&&child| child != 0)
        .count()
}

#[test]
fn the_default_ladder_thins_with_depth() {
    let bench = Workbench::new().expect("workbench");
    let mgr = bench.mount().expect("mount");

    let dirs = nested_dirs(&mgr, 5).expect("nested dirs");
    let counts: Vec<usize> = dirs
        .iter()
        .map(|&inum| replica_count(&mgr, inum))
        .collect();
    assert_eq!(counts, [2, 2, 1, 1, 0], "two tiers then bare");

    // Root itself never carries replicas.
    assert_eq!(replica_count(&mgr, InodeNumber::ROOT), 0);
}

#[test]
fn custom_thresholds_move_the_tiers() {
    let bench = Workbench::new().expect("workbench");
    let options = FsOptions {
        ditto: DittoPolicy {
            lower: 1,
            higher: 2,
        },
        ..FsOptions::default()
    };
    let mgr = bench.mount_with(options).expect("mount");

    let dirs = nested_dirs(&mgr, 3).expect("nested dirs");
    let counts: Vec<usize> = dirs
        .iter()
        .map(|&inum| replica_count(&mgr, inum))
        .collect();
    assert_eq!(counts, [2, 1, 0]);
}

#[test]
fn fresh_directory_replicas_match_their_primary() {
    let bench = Workbench::new().expect("workbench");
    let mgr = bench.mount().expect("mount");

    let dir = mgr.mkdir("/album").expect("mkdir");
    let record = mgr.fs().read_record(dir).expect("record");
    let children = record.children();
    assert!(children[0] != 0 && children[1] != 0);

    for child in children {
        let replica = mgr
            .fs()
            .read_record(InodeNumber(child))
            .expect("replica record");
        assert_eq!(replica.size, record.size);
        assert_eq!(replica.checksum, record.checksum);

        // The copied bytes are the directory's own entries.
        let content = mgr
            .read_verified_inode(InodeNumber(child))
            .expect("replica content");
        let dot = dfs_ondisk::parse_dirent(&content, 0).expect("dot entry");
        let dotdot = dfs_ondisk::parse_dirent(&content, 1).expect("dotdot entry");
        assert_eq!((dot.name.as_str(), dot.inum), (".", dir));
        assert_eq!((dotdot.name.as_str(), dotdot.inum), ("..", InodeNumber::ROOT));
    }
}

#[test]
fn membership_changes_keep_replicas_in_lockstep() {
    let bench = Workbench::new().expect("workbench");
    let mgr = bench.mount().expect("mount");

    let dir = mgr.mkdir("/home").expect("mkdir");
    let children = mgr.fs().read_record(dir).expect("record").children();

    for name in ["/home/a.txt", "/home/b.txt", "/home/c.txt"] {
        mgr.import(name, &patterned(300, 7)).expect("import");

        let record = mgr.fs().read_record(dir).expect("dir record");
        for child in children {
            let replica = mgr
                .fs()
                .read_record(InodeNumber(child))
                .expect("replica record");
            assert_eq!(replica.checksum, record.checksum, "stale after {name}");
            assert_eq!(replica.size, record.size);
        }
    }
}

#[test]
fn deep_files_round_trip_without_replicas() {
    let bench = Workbench::new().expect("workbench");
    let mgr = bench.mount().expect("mount");

    nested_dirs(&mgr, 5).expect("nested dirs");
    let data = patterned(2000, 17);
    let inum = mgr
        .import("/d0/d1/d2/d3/d4/leaf.bin", &data)
        .expect("import");

    assert_eq!(replica_count(&mgr, inum), 0, "files never auto-replicate");
    assert_eq!(
        mgr.read_verified("/d0/d1/d2/d3/d4/leaf.bin").expect("read"),
        data
    );
}
