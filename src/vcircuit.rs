// Copyright 2021 Stratus Data Systems, Inc.

//! Provisioning of the layer-2 virtual circuit that carries the multicast
//! to the peer. The actual work is done by an external tool invoked as a
//! child process; this module owns the spawn, the privilege bracket around
//! it, and the dummy short-circuit that lets the test suite run without
//! real switching infrastructure.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use slog::{debug, info, warn, Logger};

use crate::error::EngineError;
use crate::types::VcEndPoint;

/// The reserved handle returned for a dummy circuit.
pub const DUMMY_CIRCUIT_ID: &str = "dummy_circuitId";

const DUMMY_PREFIX: &str = "dummy";

/// Interpreter and scripts are fixed at build time; the environment
/// variables exist so a deployment can point at its own provisioning tool.
const INTERPRETER: &str = match option_env!("UPFEED_VC_INTERPRETER") {
    Some(path) => path,
    None => "python",
};
const PROVISION_SCRIPT: &str = match option_env!("UPFEED_VC_PROVISION") {
    Some(path) => path,
    None => "provision.py",
};
const REMOVE_SCRIPT: &str = match option_env!("UPFEED_VC_REMOVE") {
    Some(path) => path,
    None => "remove.py",
};

fn is_dummy(end: &VcEndPoint) -> bool {
    end.switch_id.starts_with(DUMMY_PREFIX)
        || end.port_id.starts_with(DUMMY_PREFIX)
}

mod privs {
    //! The provisioning tool opens privileged network APIs, so the spawn
    //! runs with elevated effective uid. Privilege is restored immediately
    //! after the spawn returns, on every path.

    use slog::{debug, Logger};

    pub fn elevate(log: &Logger) {
        let rc = unsafe { libc::seteuid(0) };
        if rc != 0 {
            debug!(log, "couldn't elevate privilege for provisioning spawn");
        }
    }

    pub fn restore(log: &Logger) {
        let uid = unsafe { libc::getuid() };
        let rc = unsafe { libc::seteuid(uid) };
        if rc != 0 {
            debug!(log, "couldn't restore privilege after provisioning spawn");
        }
    }
}

/// Creates a virtual circuit between two end-points. The returned string
/// identifies the circuit for a later `remove`.
///
/// Any end whose switch or port identifier starts with `dummy` makes the
/// whole circuit a no-op: nothing is spawned and the reserved dummy handle
/// is returned.
pub fn provision(
    workgroup: &str,
    description: &str,
    end1: &VcEndPoint,
    end2: &VcEndPoint,
    log: &Logger,
) -> Result<String, EngineError> {
    if is_dummy(end1) || is_dummy(end2) {
        info!(log, "ignoring call to create a dummy virtual-circuit");
        return Ok(String::from(DUMMY_CIRCUIT_ID));
    }

    if workgroup.is_empty() || description.is_empty() {
        return Err(EngineError::Inval(format!(
            "workgroup={:?}, description={:?}, end1={}, end2={}",
            workgroup, description, end1, end2
        )));
    }

    privs::elevate(log);
    let spawn_result = Command::new(INTERPRETER)
        .arg(PROVISION_SCRIPT)
        .arg(workgroup)
        .arg(&end1.switch_id)
        .arg(&end1.port_id)
        .arg(end1.vlan_id.to_string())
        .arg(&end2.switch_id)
        .arg(&end2.port_id)
        .arg(end2.vlan_id.to_string())
        .stdout(Stdio::piped())
        .spawn();
    privs::restore(log);

    let mut child = spawn_result.map_err(|e| {
        EngineError::System(format!(
            "couldn't execute {} {}: {}",
            INTERPRETER, PROVISION_SCRIPT, e
        ))
    })?;

    let circuit_id = match child.stdout.take() {
        Some(stdout) => {
            let mut line = String::new();
            match BufReader::new(stdout).read_line(&mut line) {
                Ok(n) if n > 0 => {
                    Some(String::from(line.trim_end_matches('\n')))
                }
                _ => None,
            }
        }
        None => None,
    };

    let exit_status = child.wait().map_err(|e| {
        EngineError::System(format!(
            "couldn't reap provisioning process: {}",
            e
        ))
    })?;

    if !exit_status.success() {
        return Err(EngineError::System(format!(
            "provisioning process terminated with status {}",
            exit_status
        )));
    }

    match circuit_id {
        Some(id) if !id.is_empty() => {
            debug!(log, "virtual circuit created"; "circuit_id" => %id);
            Ok(id)
        }
        _ => Err(EngineError::System(String::from(
            "couldn't get virtual-circuit ID from provisioning process",
        ))),
    }
}

/// Destroys a virtual circuit. Failures are logged, not returned; teardown
/// paths can't do anything about them. Removing a dummy circuit is a no-op.
pub fn remove(workgroup: &str, circuit_id: &str, log: &Logger) {
    if circuit_id.starts_with(DUMMY_PREFIX) {
        info!(log, "ignoring call to remove a dummy virtual-circuit");
        return;
    }

    let status = Command::new(INTERPRETER)
        .arg(REMOVE_SCRIPT)
        .arg(workgroup)
        .arg(circuit_id)
        .status();

    match status {
        Ok(exit_status) if exit_status.success() => (),
        Ok(exit_status) => {
            warn!(log, "circuit-removal process terminated with status {}",
                exit_status; "circuit_id" => circuit_id);
        }
        Err(e) => {
            warn!(log, "couldn't destroy virtual-circuit: {}", e;
                "circuit_id" => circuit_id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use slog::{o, Discard};

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn end(switch: &str, port: &str) -> VcEndPoint {
        VcEndPoint::new(switch, port, 100)
    }

    #[test]
    fn dummy_switch_short_circuits_provisioning() {
        let id = provision(
            "wg",
            "desc",
            &end("dummy-sw", "p1"),
            &end("sw2", "p2"),
            &log(),
        )
        .unwrap();
        assert_eq!(id, DUMMY_CIRCUIT_ID);
    }

    #[test]
    fn dummy_port_on_either_end_short_circuits_provisioning() {
        for (e1, e2) in &[
            (end("sw1", "dummy-port"), end("sw2", "p2")),
            (end("sw1", "p1"), end("dummy-sw", "p2")),
            (end("sw1", "p1"), end("sw2", "dummy-port")),
        ] {
            let id = provision("wg", "desc", e1, e2, &log()).unwrap();
            assert_eq!(id, DUMMY_CIRCUIT_ID);
        }
    }

    #[test]
    fn empty_workgroup_is_invalid() {
        match provision("", "desc", &end("sw1", "p1"), &end("sw2", "p2"), &log())
        {
            Err(EngineError::Inval(_)) => (),
            other => panic!("expected Inval, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn remove_dummy_is_a_no_op() {
        // Must not spawn anything; completes instantly.
        remove("wg", DUMMY_CIRCUIT_ID, &log());
    }

    #[test]
    fn real_provisioning_fails_without_the_tool() {
        // No provisioning script exists in the test environment, so a
        // non-dummy request must surface a system error.
        let result = provision(
            "wg",
            "desc",
            &end("sw1", "p1"),
            &end("sw2", "p2"),
            &log(),
        );
        assert!(result.is_err());
    }
}
