use std::io;
use std::path::Path;
use std::process::{Child, Command};
use std::thread;

use tracing::{debug, warn};

/// Starts a game. Injected into the library so front-ends and tests can
/// decide what "launch" means.
pub trait Launcher: Send + Sync {
    fn launch(&self, path: &Path) -> io::Result<()>;
}

/// Spawns the game as a detached child process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, path: &Path) -> io::Result<()> {
        let mut command = command_for(path);
        if let Some(dir) = path.parent().filter(|d| d.is_dir()) {
            command.current_dir(dir);
        }
        let child = command.spawn()?;
        let pid = reap_in_background(child)?;
        debug!(pid, path = %path.display(), "game started");
        Ok(())
    }
}

/// Wait for `child` on its own thread so an exited game does not linger as
/// a zombie while the launcher keeps running
fn reap_in_background(mut child: Child) -> io::Result<u32> {
    let pid = child.id();
    thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(pid, %status, "game exited"),
            Err(err) => warn!(pid, error = %err, "could not wait for game"),
        })?;
    Ok(pid)
}

fn command_for(path: &Path) -> Command {
    // bundles are directories; hand them to the desktop
    if path.is_dir() {
        return open_with_default(path);
    }

    let is_script = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sh"));
    if is_script {
        let mut command = Command::new("sh");
        command.arg(path);
        return command;
    }

    Command::new(path)
}

#[cfg(target_os = "windows")]
fn open_with_default(path: &Path) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", ""]).arg(path);
    command
}

#[cfg(target_os = "macos")]
fn open_with_default(path: &Path) -> Command {
    let mut command = Command::new("open");
    command.arg(path);
    command
}

#[cfg(all(unix, not(target_os = "macos")))]
fn open_with_default(path: &Path) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(path);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn shell_scripts_run_through_sh() {
        let command = command_for(Path::new("/games/pong.SH"));
        assert_eq!(command.get_program(), OsStr::new("sh"));
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(args, vec![OsStr::new("/games/pong.SH")]);
    }

    #[test]
    fn executables_run_directly() {
        let command = command_for(Path::new("/games/doom.exe"));
        assert_eq!(command.get_program(), OsStr::new("/games/doom.exe"));
        assert_eq!(command.get_args().count(), 0);
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn bundles_open_with_the_desktop() {
        let dir = TempDir::new().expect("tempdir");
        let bundle = dir.path().join("Solitaire.app");
        fs::create_dir_all(&bundle).expect("mkdir");
        assert_eq!(command_for(&bundle).get_program(), OsStr::new("xdg-open"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exited_game_is_reaped() {
        let dir = TempDir::new().expect("tempdir");
        let script = dir.path().join("quick.sh");
        fs::write(&script, "exit 0\n").expect("write script");

        let child = command_for(&script).spawn().expect("spawn");
        let pid = reap_in_background(child).expect("reaper");

        // a zombie keeps its /proc entry until someone waits on it
        let proc_entry = Path::new("/proc").join(pid.to_string());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while proc_entry.exists() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!proc_entry.exists());
    }

    #[cfg(unix)]
    #[test]
    fn launching_a_missing_binary_fails() {
        let dir = TempDir::new().expect("tempdir");
        let err = ProcessLauncher
            .launch(&dir.path().join("nope.exe"))
            .expect_err("no such file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
