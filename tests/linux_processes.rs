//! Real-process checks against `/proc` and `kill(2)`: job-control delivery,
//! vanished-pid detection and an end-to-end throttle of a busy shell loop.

#![cfg(target_os = "linux")]

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid as NixPid;

use process_duty_limiter::core::config::TrackerConfig;
use process_duty_limiter::daemon::clock::CancelToken;
use process_duty_limiter::daemon::limiter::{LimiterExit, LimiterSettings};
use process_duty_limiter::daemon::supervisor::Supervisor;
use process_duty_limiter::logger::activity::ActivityLoggerHandle;
use process_duty_limiter::platform::pal::{
    Delivery, LinuxPlatform, Pid, ProcessPlatform, SignalKind,
};
use process_duty_limiter::target::FixedTarget;

fn spawn(program: &str, args: &[&str]) -> Child {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn test child")
}

fn state_of(platform: &LinuxPlatform, pid: Pid) -> Option<char> {
    platform.process(pid).ok().flatten().map(|stat| stat.state)
}

/// Poll until `pred` holds for the process state or the deadline passes.
fn wait_for_state(platform: &LinuxPlatform, pid: Pid, pred: impl Fn(char) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if state_of(platform, pid).is_some_and(&pred) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn cpu_of(platform: &LinuxPlatform, pids: &[Pid]) -> Duration {
    pids.iter()
        .filter_map(|&pid| platform.process(pid).ok().flatten())
        .map(|stat| stat.cpu_time)
        .sum()
}

fn children_of(platform: &LinuxPlatform, parent: Pid) -> Vec<Pid> {
    platform
        .processes()
        .unwrap()
        .into_iter()
        .filter(|stat| stat.ppid == parent)
        .map(|stat| stat.pid)
        .collect()
}

fn sigkill(pid: Pid) {
    let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
}

#[test]
fn stop_and_continue_reach_a_real_child() {
    let platform = LinuxPlatform::new();
    let mut child = spawn("sleep", &["30"]);
    let pid = child.id();

    assert_eq!(
        platform.signal(pid, SignalKind::Stop).unwrap(),
        Delivery::Delivered
    );
    assert!(wait_for_state(&platform, pid, |s| s == 'T'));

    assert_eq!(
        platform.signal(pid, SignalKind::Continue).unwrap(),
        Delivery::Delivered
    );
    assert!(wait_for_state(&platform, pid, |s| s != 'T'));

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn reaped_child_reports_not_found() {
    let platform = LinuxPlatform::new();
    let mut child = spawn("true", &[]);
    let pid = child.id();
    child.wait().unwrap();

    assert_eq!(platform.process(pid).unwrap(), None);
    assert_eq!(
        platform.signal(pid, SignalKind::Continue).unwrap(),
        Delivery::NotFound
    );
}

#[test]
fn busy_descendant_is_throttled_and_resumed_on_shutdown() {
    let platform = Arc::new(LinuxPlatform::new());
    let mut root = spawn("sh", &["-c", "(while :; do :; done) & wait"]);
    let root_pid = root.id();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut busy = children_of(&platform, root_pid);
    while busy.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
        busy = children_of(&platform, root_pid);
    }
    assert!(!busy.is_empty(), "busy subshell did not start");

    let mut settings = LimiterSettings::new("busy", 0.2);
    settings.include_descendants = true;
    settings.period = Duration::from_millis(50);
    let mut supervisor = Supervisor::new(
        Arc::clone(&platform) as Arc<dyn ProcessPlatform>,
        TrackerConfig::default(),
        ActivityLoggerHandle::detached(),
        CancelToken::new(),
    );
    supervisor
        .spawn(settings, Box::new(FixedTarget(root_pid)))
        .unwrap();

    thread::sleep(Duration::from_millis(500));
    let (cpu0, t0) = (cpu_of(&platform, &busy), Instant::now());
    thread::sleep(Duration::from_millis(1_500));
    let (cpu1, t1) = (cpu_of(&platform, &busy), Instant::now());
    let share = (cpu1 - cpu0).as_secs_f64() / (t1 - t0).as_secs_f64();
    // Unthrottled the loop would sit near 1.0.
    assert!(share < 0.5, "busy loop used {share:.2} of a core");

    let exits = supervisor.shutdown();
    assert_eq!(exits, vec![("busy".to_string(), LimiterExit::Cancelled)]);
    for &pid in &busy {
        assert!(wait_for_state(&platform, pid, |s| s != 'T'));
    }
    assert!(wait_for_state(&platform, root_pid, |s| s != 'T'));

    for pid in busy {
        sigkill(pid);
    }
    root.kill().unwrap();
    root.wait().unwrap();
}
