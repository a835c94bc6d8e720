use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{ContractSection, RoundLimits};
use crate::errors::{NodeError, NodeResult};
use crate::hash::SequenceHash;
use crate::util::sleep_ms;

const WAIT_POLL_MS: u64 = 10;

/// Everything the supervisor needs to launch one round's contract run.
pub struct ExecutionRequest {
    /// Physical root of the RW session the contract works against.
    pub rw_root: PathBuf,
    pub contract_log_dir: PathBuf,
    pub lcl_id: SequenceHash,
}

/// Launches the contract binary with the configured argv, environment,
/// uid/gid and round limits, and kills it when the execution window ends.
/// Round limits live here, not in the consensus engine.
pub fn execute(contract: &ContractSection, request: &ExecutionRequest) -> NodeResult<()> {
    let args = contract.exec_args();
    let bin_path = Path::new(&args[0]);
    if !bin_path.exists() {
        return Err(NodeError::ContractExecFailed(format!(
            "contract binary {} does not exist",
            bin_path.display()
        )));
    }

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .current_dir(&request.rw_root)
        .env("HP_LCL_SEQ_NO", request.lcl_id.seq_no.to_string())
        .env("HP_LCL_HASH", request.lcl_id.hash.to_hex());
    for (key, value) in &contract.environment {
        command.env(key, value);
    }

    if let Some((uid, gid)) = contract.run_as_ids()? {
        use std::os::unix::process::CommandExt;
        command.uid(uid).gid(gid);
    }
    apply_rlimits(&mut command, &contract.round_limits);

    if contract.log.enable {
        fs::create_dir_all(&request.contract_log_dir)?;
        let log_path = request
            .contract_log_dir
            .join(format!("r{}.log", request.lcl_id.seq_no + 1));
        let stdout = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let stderr = stdout.try_clone()?;
        command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let child = command
        .spawn()
        .map_err(|err| NodeError::ContractExecFailed(format!("spawn failed: {err}")))?;
    info!(pid = child.id(), "contract process started");
    wait_with_timeout(child, contract.round_limits.exec_timeout)
}

fn apply_rlimits(command: &mut Command, limits: &RoundLimits) {
    use std::os::unix::process::CommandExt;
    let cpu = limits.proc_cpu_seconds;
    let mem = limits.proc_mem_bytes;
    let ofd = limits.proc_ofd_count;
    unsafe {
        command.pre_exec(move || {
            set_rlimit(libc::RLIMIT_CPU, cpu)?;
            set_rlimit(libc::RLIMIT_AS, mem)?;
            set_rlimit(libc::RLIMIT_NOFILE, ofd)?;
            Ok(())
        });
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    if value == 0 {
        return Ok(());
    }
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    let ret = unsafe { libc::setrlimit(resource, &limit) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Waits for the contract to finish, killing it when `exec_timeout` ms
/// elapse (zero means no timeout).
fn wait_with_timeout(mut child: Child, exec_timeout_ms: u64) -> NodeResult<()> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                return Err(NodeError::ContractExecFailed(format!(
                    "contract exited with {status}"
                )));
            }
            Ok(None) => {}
            Err(err) => {
                return Err(NodeError::ContractExecFailed(format!(
                    "waiting for contract failed: {err}"
                )));
            }
        }
        if exec_timeout_ms > 0 && started.elapsed() >= Duration::from_millis(exec_timeout_ms) {
            warn!(pid = child.id(), "contract exceeded exec timeout, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(NodeError::ContractExecFailed(
                "contract killed on round timeout".into(),
            ));
        }
        sleep_ms(WAIT_POLL_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessMode, ConsensusConfig, ContractLogConfig, NplConfig};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;

    fn contract_with(bin_path: &str, bin_args: &str, exec_timeout: u64) -> ContractSection {
        ContractSection {
            id: "test".into(),
            execute: true,
            run_as: String::new(),
            log: ContractLogConfig {
                enable: false,
                max_mbytes_per_file: 5,
                max_file_count: 10,
            },
            version: "1.0".into(),
            unl: BTreeSet::new(),
            bin_path: bin_path.into(),
            bin_args: bin_args.into(),
            environment: BTreeMap::new(),
            max_input_ledger_offset: 10,
            consensus: ConsensusConfig {
                mode: AccessMode::Private,
                roundtime: 1_000,
                stage_slice: 25,
                threshold: 80,
            },
            npl: NplConfig {
                mode: AccessMode::Private,
            },
            round_limits: RoundLimits {
                user_input_bytes: 0,
                user_output_bytes: 0,
                npl_output_bytes: 0,
                proc_cpu_seconds: 0,
                proc_mem_bytes: 0,
                proc_ofd_count: 0,
                exec_timeout,
            },
        }
    }

    fn request(dir: &std::path::Path) -> ExecutionRequest {
        ExecutionRequest {
            rw_root: dir.to_path_buf(),
            contract_log_dir: dir.join("log"),
            lcl_id: SequenceHash::default(),
        }
    }

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("contract.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn runs_contract_in_rw_root() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(dir.path(), "echo done > witness");
        let contract = contract_with(&script, "", 0);
        execute(&contract, &request(dir.path())).expect("execute");
        assert!(dir.path().join("witness").exists());
    }

    #[test]
    fn missing_binary_is_reported() {
        let dir = tempdir().expect("tempdir");
        let contract = contract_with("/nonexistent/contract", "", 0);
        assert!(matches!(
            execute(&contract, &request(dir.path())),
            Err(NodeError::ContractExecFailed(_))
        ));
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(dir.path(), "exit 3");
        let contract = contract_with(&script, "", 0);
        assert!(matches!(
            execute(&contract, &request(dir.path())),
            Err(NodeError::ContractExecFailed(_))
        ));
    }

    #[test]
    fn runaway_contract_is_killed_on_timeout() {
        let dir = tempdir().expect("tempdir");
        let contract = contract_with("/bin/sleep", "30", 200);
        let started = Instant::now();
        assert!(matches!(
            execute(&contract, &request(dir.path())),
            Err(NodeError::ContractExecFailed(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
