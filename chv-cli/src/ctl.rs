//! One-shot control operations against a running VMM.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chv::api::{ApiResponse, Operation, RestoreConfig, VmInfo, VmSnapshotConfig, VmmPingResponse};
use chv::{ControlClient, HttpClient, Vm};

/// The VMM to talk to.
#[derive(clap::Args)]
pub struct Target {
    /// Path of the VMM's control socket.
    #[arg(long)]
    api_socket: PathBuf,
}

impl Target {
    fn client(&self) -> HttpClient {
        HttpClient::new(&self.api_socket)
    }
}

/// Arguments for `chv shutdown`.
#[derive(clap::Args)]
pub struct ShutdownArgs {
    #[command(flatten)]
    target: Target,

    /// Also ask the VMM process to exit.
    #[arg(long)]
    vmm: bool,
}

/// Arguments for `chv snapshot`.
#[derive(clap::Args)]
pub struct SnapshotArgs {
    #[command(flatten)]
    target: Target,

    /// Directory to write the snapshot into.
    dest: PathBuf,
}

/// Arguments for `chv restore`.
#[derive(clap::Args)]
pub struct RestoreArgs {
    #[command(flatten)]
    target: Target,

    /// Snapshot directory to restore from.
    src: PathBuf,
}

pub async fn ping(target: &Target) -> Result<()> {
    let resp = expect(Operation::Ping, target.client().vmm_ping().await)?;
    let ping: VmmPingResponse = chv::api::decode(&resp.body).context("malformed ping response")?;
    println!("{}", ping.version);
    Ok(())
}

pub async fn info(target: &Target) -> Result<()> {
    let resp = expect(Operation::Info, target.client().vm_info().await)?;
    let info: VmInfo = chv::api::decode(&resp.body).context("malformed vm.info response")?;
    println!("{}", serde_json::to_string_pretty(&Vm::from(info))?);
    Ok(())
}

pub async fn pause(target: &Target) -> Result<()> {
    expect(Operation::Pause, target.client().pause_vm().await).map(drop)
}

pub async fn resume(target: &Target) -> Result<()> {
    expect(Operation::Resume, target.client().resume_vm().await).map(drop)
}

pub async fn reboot(target: &Target) -> Result<()> {
    expect(Operation::Reboot, target.client().reboot_vm().await).map(drop)
}

pub async fn power_button(target: &Target) -> Result<()> {
    expect(Operation::PowerButton, target.client().power_button_vm().await).map(drop)
}

pub async fn delete(target: &Target) -> Result<()> {
    expect(Operation::Delete, target.client().delete_vm().await).map(drop)
}

pub async fn shutdown(args: &ShutdownArgs) -> Result<()> {
    let client = args.target.client();
    expect(Operation::Shutdown, client.shutdown_vm().await)?;
    if args.vmm {
        expect(Operation::ShutdownVmm, client.shutdown_vmm().await)?;
    }
    Ok(())
}

pub async fn snapshot(args: &SnapshotArgs) -> Result<()> {
    let config = VmSnapshotConfig::to_path(&absolute(&args.dest)?);
    expect(Operation::Snapshot, args.target.client().snapshot_vm(&config).await)?;
    println!("{}", config.destination_url);
    Ok(())
}

pub async fn restore(args: &RestoreArgs) -> Result<()> {
    let config = RestoreConfig::from_path(&absolute(&args.src)?);
    expect(Operation::Restore, args.target.client().restore_vm(&config).await).map(drop)
}

/// Checks the transport result and the operation's success status.
fn expect(op: Operation, resp: io::Result<ApiResponse>) -> Result<ApiResponse> {
    let resp = resp.with_context(|| format!("{op}: cannot reach vmm"))?;
    if !resp.is_success(op) {
        bail!("{op}: vmm answered {}: {}", resp.status, resp.body_text());
    }
    Ok(resp)
}

/// Snapshot URLs must name absolute paths.
fn absolute(path: &std::path::Path) -> Result<String> {
    let path = std::path::absolute(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}
