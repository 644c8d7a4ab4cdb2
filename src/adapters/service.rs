//! Systemd service wiring for the agent.
//!
//! The unit file points at the binary's current absolute path; nothing is
//! copied. All subcommands are thin systemctl wrappers.

use std::path::Path;
use std::process::Command;

const UNIT_PATH: &str = "/etc/systemd/system/nettica-client.service";
const SERVICE_NAME: &str = "nettica-client";

/// `nettica-client install`: write the unit file and start the service.
pub fn cmd_install() -> anyhow::Result<()> {
    if !is_systemd_available() {
        anyhow::bail!("systemd not available");
    }
    if !is_root() {
        anyhow::bail!("root required, use: sudo nettica-client install");
    }

    let exe_path = std::env::current_exe()?.canonicalize()?;
    let exe_str = exe_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("binary path contains invalid UTF-8"))?;

    if Path::new(UNIT_PATH).exists() {
        eprintln!("  Stopping existing service...");
        let _ = Command::new("systemctl")
            .args(["stop", SERVICE_NAME])
            .status();
    }

    let unit_content = format!(
        "[Unit]\n\
         Description=Nettica Client\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exe_str}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         LimitNOFILE=65535\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
    );
    std::fs::write(UNIT_PATH, &unit_content)?;

    run_cmd("systemctl", &["daemon-reload"])?;
    run_cmd("systemctl", &["enable", "--now", SERVICE_NAME])?;
    eprintln!("  Service installed and started.");
    Ok(())
}

/// `nettica-client uninstall`: disable and remove the unit.
pub fn cmd_uninstall() -> anyhow::Result<()> {
    ensure_root_and_service()?;
    let _ = Command::new("systemctl")
        .args(["disable", "--now", SERVICE_NAME])
        .status();
    if Path::new(UNIT_PATH).exists() {
        std::fs::remove_file(UNIT_PATH)?;
        eprintln!("  Removed {}", UNIT_PATH);
    }
    run_cmd("systemctl", &["daemon-reload"])?;
    eprintln!("  Service uninstalled. Config files are preserved.");
    Ok(())
}

pub fn cmd_start() -> anyhow::Result<()> {
    ensure_root_and_service()?;
    run_cmd("systemctl", &["start", SERVICE_NAME])?;
    eprintln!("  Service started.");
    Ok(())
}

pub fn cmd_stop() -> anyhow::Result<()> {
    ensure_root_and_service()?;
    run_cmd("systemctl", &["stop", SERVICE_NAME])?;
    eprintln!("  Service stopped.");
    Ok(())
}

pub fn cmd_status() -> anyhow::Result<()> {
    ensure_service_installed()?;
    let status = Command::new("systemctl")
        .args(["status", SERVICE_NAME])
        .status()?;
    // systemctl status returns non-zero when inactive; that's fine
    std::process::exit(status.code().unwrap_or(1));
}

fn ensure_service_installed() -> anyhow::Result<()> {
    if !Path::new(UNIT_PATH).exists() {
        anyhow::bail!("service not installed, run `sudo nettica-client install` first");
    }
    Ok(())
}

fn ensure_root_and_service() -> anyhow::Result<()> {
    ensure_service_installed()?;
    if !is_root() {
        anyhow::bail!("root required, use: sudo nettica-client <command>");
    }
    Ok(())
}

fn is_systemd_available() -> bool {
    Command::new("systemctl")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn run_cmd(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let display = format!("{} {}", program, args.join(" "));
    eprintln!("  > {}", display);
    let status = Command::new(program).args(args).status()?;
    if !status.success() {
        anyhow::bail!("command failed: {}", display);
    }
    Ok(())
}
