use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::{json, Value};

fn write_json(dir: &Path, name: &str, value: Value) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
    path
}

#[test]
fn deploy_result_is_the_only_thing_on_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    fs::create_dir(&repo).unwrap();

    let plan = write_json(
        dir.path(),
        "plan.json",
        json!({
            "id": "tp-stdout",
            "deployment_repository": repo,
            "deployer_type": "SHELL",
        }),
    );
    let infra = write_json(dir.path(), "infra.json", json!({ "name": "local" }));
    let script = write_json(
        dir.path(),
        "script.json",
        json!({
            "name": "deploy.sh",
            "inline_content": "echo OUTPUT_ENDPOINT=http://stdout:1",
        }),
    );

    for json_logs in [false, true] {
        let mut command = Command::new(env!("CARGO_BIN_EXE_testgrid-deploy"));
        command.arg("--verbose");
        if json_logs {
            command.arg("--json");
        }
        let output = command
            .arg("deploy")
            .arg("--test-plan")
            .arg(&plan)
            .arg("--infra")
            .arg(&infra)
            .arg("--script")
            .arg(&script)
            .env_remove("RUST_LOG")
            .output()
            .expect("run testgrid-deploy");

        assert!(output.status.success(), "exit status {:?}", output.status);
        let result: Value = serde_json::from_slice(&output.stdout)
            .unwrap_or_else(|e| panic!("stdout is not a single JSON document: {e}"));
        assert_eq!(result["test_plan_id"], "tp-stdout");
        assert_eq!(result["status"], "SUCCESS");

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Deploying"), "log lines missing from stderr");
    }
}
