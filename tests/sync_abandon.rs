mod common;

use std::io::Read;
use std::net::TcpListener;

use crucible::config::{HistoryMode, PeerAddr};
use crucible::hash::hash_bytes;

/// A node pointed at a peer that never answers must retry up to the
/// abandon threshold and then give up without falling over.
#[test]
fn sync_is_abandoned_after_silent_peer_retries() {
    // A "peer" that accepts connections and then says nothing.
    let listener = TcpListener::bind(("127.0.0.1", 36241)).expect("bind silent peer");
    std::thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept() {
            // Drain whatever arrives so the connection stays open.
            let _ = stream.set_read_timeout(Some(std::time::Duration::from_millis(100)));
            let mut sink = [0u8; 1024];
            let _ = stream.read(&mut sink);
            held.push(stream);
        }
    });

    let node = common::build_node(36242, common::fresh_keys(), |config, _| {
        config.node.history = HistoryMode::Full;
        // Short roundtime keeps the 0.7 * roundtime resubmission cadence
        // test-friendly.
        config.contract.consensus.roundtime = 100;
        config.mesh.known_peers.insert(PeerAddr {
            host: "127.0.0.1".to_string(),
            port: 36241,
        });
    });

    let log_sync = node.log_sync.clone().expect("full history syncer");
    log_sync.set_sync_target(20, hash_bytes(b"unreachable target"));
    assert!(log_sync.is_syncing());

    // 10 resubmissions at ~70ms each, plus scheduling slack.
    assert!(
        common::wait_until(10_000, || log_sync.take_abandoned()),
        "sync was never abandoned"
    );
    assert!(!log_sync.is_syncing());

    // The node stays operational: a new target starts a fresh attempt.
    log_sync.set_sync_target(21, hash_bytes(b"second target"));
    assert!(log_sync.is_syncing());

    node.stop();
}
