use replterm::{CommandDriver, DriverError, DriverEvent, ExecConfig, StopOutcome, Stream};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn has_program(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

async fn bounded<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(20), fut)
        .await
        .expect("operation hung")
}

fn bash(work_dir: &Path) -> CommandDriver {
    CommandDriver::new(ExecConfig::bash().with_work_dir(work_dir)).unwrap()
}

fn python(work_dir: &Path, persist: bool) -> CommandDriver {
    let config = ExecConfig::python()
        .with_work_dir(work_dir)
        .with_persistence(persist);
    CommandDriver::new(config).unwrap()
}

#[tokio::test]
async fn test_ids_follow_submission_order() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let commands: Vec<String> = (0..6).map(|i| format!("echo step-{i}")).collect();
    for (i, cmd) in commands.iter().enumerate() {
        let id = bounded(driver.submit(&[cmd])).await.unwrap();
        assert_eq!(id, i.to_string());
    }

    let log = driver.log();
    assert_eq!(log.len(), 6);
    for (i, record) in log.iter().enumerate() {
        assert_eq!(record.id, i.to_string());
        assert_eq!(record.command_text, format!("echo step-{i}\n\n"));
        assert_eq!(record.stdout, format!("step-{i}"));
        assert!(record.is_complete());
    }

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_stdout_only_command_has_empty_stderr() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let id = bounded(driver.submit(&["printf", "'one\\ntwo\\n'"])).await.unwrap();
    let record = driver.record(&id).unwrap();
    assert_eq!(record.stdout, "one\ntwo");
    assert_eq!(record.stderr, "");

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_state_persists_between_commands() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    bounded(driver.submit(&["GREETING=hello"])).await.unwrap();
    let id = bounded(driver.submit(&["echo $GREETING world"])).await.unwrap();
    assert_eq!(driver.record(&id).unwrap().stdout, "hello world");

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_error_output_is_captured() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let id = bounded(driver.submit(&["ls /definitely/not/here"])).await.unwrap();
    let record = driver.record(&id).unwrap();
    assert!(record.is_complete());
    assert!(!record.stderr.is_empty());
    assert_eq!(record.stdout, "");

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_stderr_unblocks_before_sentinel() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let started = Instant::now();
    let id = bounded(driver.submit(&["echo before; echo oops >&2; sleep 2; echo after"]))
        .await
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "stderr should unblock the command before the sentinel"
    );

    let record = driver.record(&id).unwrap();
    assert_eq!(record.stderr, "oops");
    assert_eq!(record.stdout, "before");
    assert!(!record.is_complete());

    // The sentinel still lands on the first command, and nothing leaks.
    let next = bounded(driver.submit(&["echo next"])).await.unwrap();
    assert_eq!(driver.record(&next).unwrap().stdout, "next");
    let record = driver.record(&id).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.stdout, "before\nafter");
    assert_eq!(record.stderr, "oops");

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_output_after_quiet_stderr_is_kept() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let id = bounded(driver.submit(&["echo warn >&2; sleep 0.5; echo 42"]))
        .await
        .unwrap();
    bounded(driver.submit(&["true"])).await.unwrap();

    let record = driver.record(&id).unwrap();
    assert_eq!(record.stdout, "42");
    assert_eq!(record.stderr, "warn");
    assert!(record.is_complete());

    bounded(driver.shutdown()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_restart_after_external_kill() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    bounded(driver.submit(&["echo first"])).await.unwrap();
    let pid = driver.pid().unwrap();
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let id = bounded(driver.submit(&["echo back"])).await.unwrap();
    assert_eq!(driver.restarts(), 1);
    assert_ne!(driver.pid(), Some(pid));
    assert_eq!(driver.record(&id).unwrap().stdout, "back");
    assert_eq!(driver.log().len(), 2);

    bounded(driver.shutdown()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_submit_right_after_kill_restarts_once() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    for round in 0..5 {
        bounded(driver.submit(&[format!("echo first-{round}")])).await.unwrap();
        let pid = driver.pid().unwrap();
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }

        let id = bounded(driver.submit(&[format!("echo back-{round}")]))
            .await
            .unwrap();
        assert_eq!(driver.restarts(), round + 1);
        assert_ne!(driver.pid(), Some(pid));
        let record = driver.record(&id).unwrap();
        assert!(record.is_complete());
        assert_eq!(record.stdout, format!("back-{round}"));
    }
    assert_eq!(driver.log().len(), 10);

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_twice() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());
    bounded(driver.submit(&["true"])).await.unwrap();

    let first = bounded(driver.shutdown()).await.unwrap();
    assert_eq!(first, StopOutcome::Exited);
    assert!(!driver.is_running());

    let second = bounded(driver.shutdown()).await.unwrap();
    assert_eq!(second, StopOutcome::NotRunning);
    assert!(!driver.is_running());
}

#[tokio::test]
async fn test_interrupt_shuts_down() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let interrupt = driver.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        interrupt.cancel();
    });

    let err = bounded(driver.submit(&["sleep 30"])).await.unwrap_err();
    assert!(matches!(err, DriverError::Interrupted));
    assert!(!driver.is_running());
    assert!(driver.is_halted());
    assert!(driver.record("0").unwrap().is_complete());
}

#[tokio::test]
async fn test_run_loop_consumes_channel() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        for cmd in ["X=4", "echo $((X * 2))"] {
            tx.send(vec![cmd.to_string()]).await.unwrap();
        }
    });

    bounded(driver.run(rx)).await.unwrap();
    assert_eq!(driver.record("1").unwrap().stdout, "8");
    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_events_are_broadcast() {
    if !has_program("bash") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = bash(tmp.path());
    let mut rx = driver.subscribe();

    bounded(driver.submit(&["echo observed"])).await.unwrap();
    bounded(driver.shutdown()).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], DriverEvent::ProcessStarted { .. }));
    assert!(seen.contains(&DriverEvent::CommandDispatched { id: "0".into() }));
    assert!(seen.contains(&DriverEvent::Output {
        stream: Stream::Stdout,
        line: "observed".into()
    }));
    assert!(seen.contains(&DriverEvent::CommandCompleted { id: "0".into() }));
    assert!(!seen.iter().any(|e| matches!(
        e,
        DriverEvent::Output { line, .. } if line.contains("END_OF_EXECUTION")
    )));
}

#[tokio::test]
async fn test_python_session() {
    if !has_program("python3") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = python(tmp.path(), false);

    bounded(driver.submit(&["a = 1;b=2;c=3"])).await.unwrap();
    let id = bounded(driver.submit(&["print(a+b)"])).await.unwrap();
    let record = driver.record(&id).unwrap();
    assert_eq!(record.stdout, "3");
    assert_eq!(record.stderr, "");

    let id = bounded(driver.submit(&["print(a+b"])).await.unwrap();
    assert!(!driver.record(&id).unwrap().stderr.is_empty());

    let id = bounded(driver.submit(&["print(a + b + c)"])).await.unwrap();
    assert_eq!(driver.record(&id).unwrap().stdout, "6");

    bounded(driver.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_python_persistence_round_trip() {
    if !has_program("python3") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let work_dir = tmp.path().join("pyexe");

    {
        let mut driver = python(&work_dir, true);
        for cmd in ["print('Hello from Python!')", "a = 1;b=2;c=3", "print(a + b)"] {
            bounded(driver.submit(&[cmd])).await.unwrap();
        }
        assert_eq!(driver.record("0").unwrap().stdout, "Hello from Python!");
        bounded(driver.shutdown()).await.unwrap();
    }

    assert!(work_dir.join("session.json").is_file());
    assert!(work_dir.join(".gitignore").is_file());
    assert!(work_dir.join("2").join("state.blob").is_file());

    let mut resumed = CommandDriver::resume(&work_dir).unwrap();
    assert_eq!(resumed.log().len(), 3);

    let id = bounded(resumed.submit(&["print(2*a + b + c)"])).await.unwrap();
    assert_eq!(id, "3");
    assert_eq!(resumed.record(&id).unwrap().stdout, "7");

    bounded(resumed.shutdown()).await.unwrap();
    resumed.purge_work_area().unwrap();
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn test_python_load_runtime_state() {
    if !has_program("python3") {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut driver = python(tmp.path(), true);

    bounded(driver.submit(&["x = 10"])).await.unwrap();
    bounded(driver.submit(&["x = 99"])).await.unwrap();
    bounded(driver.load_runtime_state("0")).await.unwrap();
    let id = bounded(driver.submit(&["print(x)"])).await.unwrap();
    assert_eq!(driver.record(&id).unwrap().stdout, "10");

    bounded(driver.shutdown()).await.unwrap();
}
