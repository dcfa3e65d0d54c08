//! Text of the helper that swaps the marker onto the executable after the
//! host exits.

use std::path::{Path, PathBuf};

/// Seconds the helper waits for the host before killing it.
pub const HOST_WAIT_SECS: u32 = 30;
pub const MOVE_ATTEMPTS: u32 = 5;
pub const MOVE_DELAY_SECS: u32 = 2;

/// Everything the helper needs to know; it has no other channel to the host.
#[derive(Debug, Clone)]
pub struct RestartPlan {
    pub install_dir: PathBuf,
    pub executable: PathBuf,
    pub marker: PathBuf,
    pub host_pid: u32,
    pub diag_log: Option<PathBuf>,
    pub host_wait_secs: u32,
}

impl RestartPlan {
    pub fn new(install_dir: &Path, executable: &Path, marker: &Path, host_pid: u32) -> Self {
        RestartPlan {
            install_dir: install_dir.to_path_buf(),
            executable: executable.to_path_buf(),
            marker: marker.to_path_buf(),
            host_pid,
            diag_log: None,
            host_wait_secs: HOST_WAIT_SECS,
        }
    }

    pub fn with_diag_log(mut self, log: &Path) -> Self {
        self.diag_log = Some(log.to_path_buf());
        self
    }
}

const SH_TEMPLATE: &str = r#"#!/bin/sh
# updraft restart helper
PID=@PID@
EXE=@EXE@
MARKER=@MARKER@
LOG=@LOG@

log() {
    printf '%s [restart] %s\n' "$(date '+%Y-%m-%dT%H:%M:%S')" "$1" >> "$LOG" 2>/dev/null
}

waited=0
while kill -0 "$PID" 2>/dev/null; do
    if [ "$waited" -ge @WAIT@ ]; then
        log "host $PID still running after @WAIT@s, terminating it"
        kill -9 "$PID" 2>/dev/null
        sleep 1
        break
    fi
    sleep 1
    waited=$((waited + 1))
done

attempt=1
until mv -f "$MARKER" "$EXE" 2>/dev/null; do
    if [ "$attempt" -ge @ATTEMPTS@ ]; then
        log "could not move $MARKER onto $EXE after $attempt attempts"
        exit 1
    fi
    attempt=$((attempt + 1))
    sleep @DELAY@
done
chmod +x "$EXE" 2>/dev/null

log "executable replaced, relaunching $EXE"
"$EXE" >/dev/null 2>&1 &
rm -f "$0"
exit 0
"#;

const BAT_TEMPLATE: &str = r#"@echo off
rem updraft restart helper
setlocal
set "PID=@PID@"
set "EXE=@EXE@"
set "MARKER=@MARKER@"
set "LOG=@LOG@"

set /a waited=0
:wait
tasklist /fi "PID eq %PID%" 2>nul | find "%PID%" >nul
if errorlevel 1 goto swap
if %waited% geq @WAIT@ (
    >>"%LOG%" echo %date% %time% [restart] host %PID% still running after @WAIT@s, terminating it
    taskkill /f /pid %PID% >nul 2>&1
    timeout /t 1 /nobreak >nul
    goto swap
)
timeout /t 1 /nobreak >nul
set /a waited+=1
goto wait

:swap
set /a attempt=1
:move
move /y "%MARKER%" "%EXE%" >nul 2>&1
if not errorlevel 1 goto launch
if %attempt% geq @ATTEMPTS@ (
    >>"%LOG%" echo %date% %time% [restart] could not move marker onto executable after %attempt% attempts
    exit /b 1
)
set /a attempt+=1
timeout /t @DELAY@ /nobreak >nul
goto move

:launch
>>"%LOG%" echo %date% %time% [restart] executable replaced, relaunching
start "" "%EXE%"
(goto) 2>nul & del "%~f0"
"#;

/// Single-quote `p` for POSIX sh.
fn sh_quote(p: &Path) -> String {
    format!("'{}'", p.to_string_lossy().replace('\'', r"'\''"))
}

/// Value for a `set "NAME=..."` line; `%` must be doubled.
fn bat_value(p: &Path) -> String {
    p.to_string_lossy().replace('%', "%%")
}

fn fill(template: &str, plan: &RestartPlan, quote: fn(&Path) -> String, null: &str) -> String {
    let log = plan
        .diag_log
        .as_deref()
        .map(quote)
        .unwrap_or_else(|| null.to_string());
    template
        .replace("@PID@", &plan.host_pid.to_string())
        .replace("@EXE@", &quote(&plan.executable))
        .replace("@MARKER@", &quote(&plan.marker))
        .replace("@LOG@", &log)
        .replace("@WAIT@", &plan.host_wait_secs.to_string())
        .replace("@ATTEMPTS@", &MOVE_ATTEMPTS.to_string())
        .replace("@DELAY@", &MOVE_DELAY_SECS.to_string())
}

pub fn render_sh(plan: &RestartPlan) -> String {
    fill(SH_TEMPLATE, plan, sh_quote, "/dev/null")
}

pub fn render_bat(plan: &RestartPlan) -> String {
    fill(BAT_TEMPLATE, plan, bat_value, "NUL").replace('\n', "\r\n")
}

/// Helper text for the platform this binary was built for.
pub fn render(plan: &RestartPlan) -> String {
    if cfg!(windows) {
        render_bat(plan)
    } else {
        render_sh(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> RestartPlan {
        RestartPlan::new(
            Path::new("/opt/it's app"),
            Path::new("/opt/it's app/app"),
            Path::new("/opt/it's app/app.new"),
            4242,
        )
    }

    #[test]
    fn sh_quotes_single_quotes_and_fills_every_placeholder() {
        let s = render_sh(&plan());
        assert!(s.starts_with("#!/bin/sh\n"));
        assert!(s.contains("PID=4242\n"));
        assert!(s.contains(r"EXE='/opt/it'\''s app/app'"));
        assert!(s.contains(r"MARKER='/opt/it'\''s app/app.new'"));
        assert!(s.contains("LOG=/dev/null"));
        assert!(s.contains("-ge 30 ]"));
        assert!(!s.contains('@'));
    }

    #[test]
    fn bat_doubles_percent_and_uses_crlf() {
        let p = RestartPlan::new(
            Path::new(r"C:\Apps\100%"),
            Path::new(r"C:\Apps\100%\app.exe"),
            Path::new(r"C:\Apps\100%\app.exe.new"),
            7,
        )
        .with_diag_log(Path::new(r"C:\Temp\updraft_update_7.log"));
        let s = render_bat(&p);
        assert!(s.contains(r#"set "EXE=C:\Apps\100%%\app.exe""#));
        assert!(s.contains(r#"set "LOG=C:\Temp\updraft_update_7.log""#));
        assert!(s.contains("set \"PID=7\"\r\n"));
        assert!(!s.contains("@PID@"));
        assert!(!s.replace("\r\n", "").contains('\n'));
    }
}
