mod common;

use std::fs;

use crucible::config::{HpConfig, PatchConfig};
use crucible::crypto::{generate_keypair, pubkey_bytes};

/// A patch file written inside the contract filesystem during a round must
/// reconfigure the runtime UNL at the round boundary and be mirrored back
/// into hp.cfg.
#[test]
fn patch_update_applies_to_unl_and_config() {
    let added_key = generate_keypair();
    let added_hex = hex::encode(pubkey_bytes(&added_key.public));
    let added_bin = pubkey_bytes(&added_key.public);

    let staged_patch = std::env::temp_dir().join(format!("crucible-patch-{}", std::process::id()));
    let added_for_config = added_hex.clone();
    let staged_for_config = staged_patch.clone();
    let mut node = common::build_node(36221, common::fresh_keys(), move |config, _| {
        config.contract.consensus.roundtime = 500;
        config.mesh.listen = false;
        // The "contract" copies a staged patch file over the overlay,
        // adding one pubkey to the unl.
        let mut patched = PatchConfig::from_contract(&config.contract);
        patched.unl.insert(added_for_config);
        fs::write(
            &staged_for_config,
            serde_json::to_string_pretty(&patched).expect("encode patch"),
        )
        .expect("stage patch");
        config.contract.execute = true;
        config.contract.bin_path = "/bin/cp".to_string();
        config.contract.bin_args = format!("{} ../patch.cfg", staged_for_config.display());
    });

    assert!(!node.unl.exists(&added_bin));
    node.start_engine();

    let unl = node.unl.clone();
    assert!(
        common::wait_until(15_000, || unl.exists(&added_bin)),
        "patched unl entry never became trusted"
    );

    let on_disk = HpConfig::load(&node.ctx.config_file).expect("reload config");
    assert!(
        on_disk.contract.unl.contains(&added_hex),
        "hp.cfg does not reflect the patched unl"
    );

    node.stop();
    let _ = fs::remove_file(staged_patch);
}
