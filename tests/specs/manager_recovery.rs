//! Seed spec: process-manager self-crash. Children survive, and a restarted
//! manager adopts them without double-starting.

use std::time::Duration;

use serde_json::Map;
use serial_test::serial;

use crate::prelude::*;

fn write_manifest(env: &BusEnv) -> std::path::PathBuf {
    let path = env.state_dir().join("manifest.toml");
    let worker_bin = binary_path("vj-example-worker");
    std::fs::write(
        &path,
        format!(
            "[[worker]]\nname = \"example_worker\"\ncommand = \"{}\"\n",
            worker_bin.display()
        ),
    )
    .unwrap();
    path
}

#[tokio::test]
#[serial]
async fn children_survive_a_manager_crash_and_are_adopted_on_restart() {
    let mut env = BusEnv::new();
    let manifest = write_manifest(&env);

    let mut cmd = env.command("vjpm", &[]);
    cmd.env("VJ_PM_MANIFEST", &manifest);
    let pm_pid = env.spawn_cmd(cmd);

    env.wait_for_worker("process_manager");
    let worker = env.wait_for_worker("example_worker");

    // Kill the manager outright; the child keeps running and heartbeating
    signal(pm_pid, "-9");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pid_alive(worker.pid), "worker died with the manager");

    let before_restart = env.wait_for_worker("example_worker");
    assert_eq!(before_restart.instance_id, worker.instance_id);

    // Restart the manager; it must adopt, not double-start
    let mut cmd = env.command("vjpm", &[]);
    cmd.env("VJ_PM_MANIFEST", &manifest);
    let new_pm_pid = env.spawn_cmd(cmd);
    env.wait_for_worker("process_manager");

    let client = env.client();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut adopted = false;
    while tokio::time::Instant::now() < deadline && !adopted {
        adopted = list_workers(&client)
            .await
            .map(|workers| {
                workers.iter().any(|w| {
                    w["name"] == serde_json::json!("example_worker")
                        && w["status"] == serde_json::json!("running")
                        && w["instance_id"] == serde_json::json!(worker.instance_id.clone())
                })
            })
            .unwrap_or(false);
        if !adopted {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    assert!(adopted, "restarted manager did not adopt the running worker");

    // Same pid, same instance, unchanged generation: no double-start
    let after = env.wait_for_worker("example_worker");
    assert_eq!(after.pid, worker.pid);
    assert_eq!(after.instance_id, worker.instance_id);
    assert_eq!(after.generation, worker.generation);

    signal(new_pm_pid, "-15");
}

async fn list_workers(client: &vj_client::BusClient) -> Option<Vec<serde_json::Value>> {
    let ack = client
        .send_command(
            "process_manager",
            "list_workers",
            Map::new(),
            "",
            Duration::from_millis(500),
        )
        .await
        .ok()?;
    ack.result?.get("workers")?.as_array().cloned()
}
