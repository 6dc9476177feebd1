//! Storage device operations.

use crate::error::Fault;
use nix::errno::Errno;
use privd_log::debug;
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::Path,
};
use tokio::{fs, process::Command, task};

const SCSI_ID: &str = "scsi_id";
const DMSETUP: &str = "dmsetup";
const ISCSI_HOSTS: &str = "/sys/class/iscsi_host";
const SCSI_HOSTS: &str = "/sys/class/scsi_host";
const BLOCK_DEVICES: &str = "/sys/dev/block";

/// Alignment of direct I/O buffers.
const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Run a command and return its standard output.
async fn run(program: &str, args: &[&str]) -> Result<String, Fault> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Fault::Operation(format!(
            "{} failed ({}): {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(super) async fn scsi_serial(device: &str) -> Result<String, Fault> {
    let device = format!("--device={}", device);
    let output = run(
        SCSI_ID,
        &[
            "--page=0x80",
            "--whitelisted",
            "--export",
            "--replace-whitespace",
            &device,
        ],
    )
    .await?;

    Ok(parse_scsi_serial(&output))
}

fn parse_scsi_serial(output: &str) -> String {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("ID_SERIAL="))
        .unwrap_or_default()
        .to_string()
}

/// Trigger a rescan of every SCSI host that belongs to iSCSI.
pub(super) async fn force_iscsi_scan() -> Result<(), Fault> {
    let mut hosts = match fs::read_dir(ISCSI_HOSTS).await {
        Ok(hosts) => hosts,
        // No iSCSI sessions, nothing to scan.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    while let Some(host) = hosts.next_entry().await? {
        let scan = Path::new(SCSI_HOSTS).join(host.file_name()).join("scan");
        debug!("Scanning {}", scan.display());
        fs::write(&scan, "- - -").await?;
    }

    Ok(())
}

/// Read one block from every device, bypassing the page cache.
pub(super) async fn test_read_devices(devices: &[String], size: usize) -> Result<(), Fault> {
    let devices = devices.to_vec();
    task::spawn_blocking(move || {
        devices
            .iter()
            .try_for_each(|device| read_device(Path::new(device), size))
    })
    .await
    .map_err(|err| Fault::Operation(err.to_string()))?
}

fn read_device(device: &Path, size: usize) -> Result<(), Fault> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(device)?;

    // O_DIRECT requires an aligned buffer.
    let mut buffer = vec![0u8; size + DIRECT_IO_ALIGNMENT];
    let offset = buffer.as_ptr().align_offset(DIRECT_IO_ALIGNMENT);
    let block = &mut buffer[offset..offset + size];

    let length = file.read_at(block, size as u64)?;
    if length < size {
        return Err(Fault::os(
            Errno::EIO,
            format!("Could not read from device {}", device.display()),
        ));
    }

    Ok(())
}

pub(super) async fn remove_mapping(name: &str) -> Result<(), Fault> {
    run(DMSETUP, &["remove", name]).await.map(|_| ())
}

/// Return the state of every multipath path.
///
/// Paths are keyed by kernel device name, or by `major:minor` when the
/// number does not resolve under `/sys/dev/block`.
pub(super) async fn paths_status() -> Result<BTreeMap<String, String>, Fault> {
    let output = run(DMSETUP, &["status", "--target", "multipath"]).await?;

    Ok(parse_paths_status(&output)
        .into_iter()
        .map(|(number, state)| (device_name(&number), state.to_string()))
        .collect())
}

/// Parse `major:minor A|F` pairs from multipath status lines.
fn parse_paths_status(output: &str) -> Vec<(String, &'static str)> {
    output
        .lines()
        .filter_map(|line| line.splitn(2, ':').nth(1))
        .flat_map(|status| {
            let tokens = status.split_whitespace().collect::<Vec<_>>();
            tokens
                .windows(2)
                .filter_map(|pair| {
                    let state = match pair[1] {
                        "A" => "active",
                        "F" => "failed",
                        _ => return None,
                    };
                    is_device_number(pair[0]).then(|| (pair[0].to_string(), state))
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn is_device_number(token: &str) -> bool {
    let mut parts = token.split(':');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(major), Some(minor), None)
            if !major.is_empty()
                && !minor.is_empty()
                && major.chars().chain(minor.chars()).all(|c| c.is_ascii_digit())
    )
}

/// Resolve `major:minor` to the kernel device name, if possible.
fn device_name(number: &str) -> String {
    std::fs::read_link(Path::new(BLOCK_DEVICES).join(number))
        .ok()
        .and_then(|link| link.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| number.to_string())
}
