use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kidtracker_device::{
    DebugHandler, DeviceListener, FrameHandler, MemoryStore, MessageHandler, Registry,
    RegistryConfig,
};
use kidtracker_frame::FrameConfig;
use serde::Deserialize;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{
    device_error, io_error, store_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS,
    USAGE,
};
use crate::output::{print_listening, OutputFormat};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Watches admitted by the gateway, preloaded before listening.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Seed {
    devices: Vec<String>,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let frame_config = frame_config(&args)?;
    let registry_config = registry_config(&args)?;
    let clean_interval = parse_duration(&args.clean_interval)?;

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &args.seed {
        load_seed(&store, path)?;
    }
    let registry = Arc::new(Registry::new(
        store.clone(),
        store.clone(),
        registry_config,
    ));

    let mut listeners = vec![bind(
        "device",
        &args.device_addr,
        Arc::new(MessageHandler::new(Arc::clone(&registry))),
        &frame_config,
    )?];
    if !args.no_debug {
        listeners.push(bind(
            "debug",
            &args.debug_addr,
            Arc::new(DebugHandler),
            &frame_config,
        )?);
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    for listener in &listeners {
        print_listening(listener.name(), listener.local_addr(), format);
    }

    for listener in listeners {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name(format!("{}-listener", listener.name()))
            .spawn(move || listener.run(&running))
            .map_err(|err| io_error("listener thread failed", err))?;
    }

    {
        let registry = Arc::clone(&registry);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || {
                while sleep_while_running(&running, clean_interval) {
                    registry.clean();
                }
            })
            .map_err(|err| io_error("sweeper thread failed", err))?;
    }

    while running.load(Ordering::SeqCst) {
        thread::sleep(SHUTDOWN_POLL);
    }
    tracing::info!(devices = registry.len(), "shutting down");

    Ok(SUCCESS)
}

fn bind(
    name: &str,
    addr: &str,
    handler: Arc<dyn FrameHandler>,
    frame_config: &FrameConfig,
) -> CliResult<DeviceListener> {
    let listener = DeviceListener::bind(addr, handler)
        .map_err(|err| device_error(&format!("{name} listener bind failed"), err))?;
    Ok(listener
        .with_name(name)
        .with_frame_config(frame_config.clone()))
}

fn frame_config(args: &ServeArgs) -> CliResult<FrameConfig> {
    if args.chunk_size == 0 {
        return Err(CliError::new(USAGE, "chunk size must be greater than zero"));
    }
    Ok(FrameConfig {
        chunk_size: args.chunk_size,
        poll_interval: Some(parse_duration(&args.poll_interval)?),
        write_timeout: Some(parse_duration(&args.write_timeout)?),
    })
}

fn registry_config(args: &ServeArgs) -> CliResult<RegistryConfig> {
    if args.token_length == 0 {
        return Err(CliError::new(USAGE, "token length must be greater than zero"));
    }
    Ok(RegistryConfig {
        token_length: args.token_length,
        token_ttl: parse_duration(&args.token_ttl)?,
        device_job_ttl: parse_duration(&args.device_job_ttl)?,
    })
}

fn load_seed(store: &MemoryStore, path: &Path) -> CliResult<()> {
    let text = fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    let seed: Seed = serde_json::from_str(&text).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("invalid seed file {}: {err}", path.display()),
        )
    })?;
    apply_seed(store, seed)
}

fn apply_seed(store: &MemoryStore, seed: Seed) -> CliResult<()> {
    for device_id in &seed.devices {
        store
            .add_device(device_id.as_str())
            .map_err(|err| store_error("seed failed", err))?;
    }
    tracing::info!(devices = seed.devices.len(), "seed loaded");
    Ok(())
}

/// Sleep for `duration` in short steps. Returns false as soon as `running`
/// is cleared.
fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
