mod common;

use crucible::cafs::driver::copy_dir_recursive;
use crucible::config::{HistoryMode, PeerAddr};

/// Full-history catch-up across two nodes: the lagging node walks back to
/// the joining point, truncates its stray log records and imports the
/// missing suffix from the serving peer.
#[test]
fn forked_node_truncates_and_imports_log_suffix() {
    let keys_a = common::fresh_keys();
    let keys_b = common::fresh_keys();

    let mut node_a = common::build_node(36231, keys_a, |config, _| {
        config.node.history = HistoryMode::Full;
        config.contract.consensus.roundtime = 500;
    });

    // Rounds 1..=2 on the serving node.
    for seq in 1..=2u64 {
        common::commit_fs_round(&node_a.contract_fs, &node_a.ledger, seq, &format!("round {seq}"));
    }

    // The lagging node is a copy of the serving node at round 2.
    let node_b = {
        let staged = std::env::temp_dir().join(format!("crucible-fork-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&staged);
        copy_dir_recursive(&node_a.ctx.contract_fs_dir, &staged.join("contract_fs"))
            .expect("copy contract fs");
        copy_dir_recursive(&node_a.ctx.ledger_fs_dir, &staged.join("ledger_fs"))
            .expect("copy ledger fs");
        let node_b = common::build_node(36232, keys_b, |config, _| {
            config.node.history = HistoryMode::Full;
            config.contract.consensus.roundtime = 500;
            config.mesh.known_peers.insert(PeerAddr {
                host: "127.0.0.1".to_string(),
                port: 36231,
            });
        });
        // Replace B's pristine trees with the copies taken at round 2.
        std::fs::remove_dir_all(&node_b.ctx.contract_fs_dir).expect("clear contract fs");
        std::fs::remove_dir_all(&node_b.ctx.ledger_fs_dir).expect("clear ledger fs");
        copy_dir_recursive(&staged.join("contract_fs"), &node_b.ctx.contract_fs_dir)
            .expect("install contract fs");
        copy_dir_recursive(&staged.join("ledger_fs"), &node_b.ctx.ledger_fs_dir)
            .expect("install ledger fs");
        let _ = std::fs::remove_dir_all(&staged);
        node_b
    };

    // The serving node moves on to rounds 3..=4.
    for seq in 3..=4u64 {
        common::commit_fs_round(&node_a.contract_fs, &node_a.ledger, seq, &format!("round {seq}"));
    }
    let target_root = node_a.contract_fs.root_hash().expect("target root");

    // The lagging node wrote log records past its ledger before it died.
    common::fake_index_round(&node_b.contract_fs, 3, "stray three");
    common::fake_index_round(&node_b.contract_fs, 4, "stray four");
    assert_eq!(node_b.contract_fs.get_last_seq_no_from_index().expect("tip"), 4);
    assert_eq!(node_b.ledger.get_last_ledger().expect("tip").seq_no, 2);

    assert!(
        common::wait_until(10_000, || {
            node_a.network.connected_count() == 1 && node_b.network.connected_count() == 1
        }),
        "peers did not connect"
    );

    let log_sync = node_b.log_sync.clone().expect("full history syncer");
    log_sync.set_sync_target(4, target_root);

    // The stray records must be truncated and the true suffix imported.
    let mount_b = node_b.contract_fs.clone();
    assert!(
        common::wait_until(20_000, || {
            mount_b
                .get_hash_from_index_by_seq_no(4)
                .map(|hash| hash == target_root)
                .unwrap_or(false)
        }),
        "log import did not reach the target"
    );
    assert_eq!(mount_b.root_hash().expect("root"), target_root);

    // Once the ledger catches up too (served by ledger sync in production),
    // the syncer reports the target archived.
    for seq in 3..=4u64 {
        let record = node_a
            .ledger
            .get_ledger_by_seq_no(seq)
            .expect("query")
            .expect("record");
        node_b
            .ledger
            .append_round(&record, &Default::default())
            .expect("append");
    }
    assert!(
        common::wait_until(20_000, || log_sync.take_achieved()),
        "sync target was never declared archived"
    );
    assert!(!log_sync.is_syncing());

    node_a.stop();
    node_b.stop();
}
