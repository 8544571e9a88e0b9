mod audio;
mod callerid;
mod clients;
mod config;
mod engine;
mod error;
mod hid;
mod server;

use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use hidapi::HidApi;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use crate::audio::{AudioPipeline, CallerIdAssets};
use crate::engine::{Exchange, SharedExchange};
use crate::error::{lock, Error, Result};
use crate::hid::{LinePoller, PRODUCT_ID, VENDOR_ID};
use crate::server::ControlServer;

const CONFIG_PATH: &str = "./config.toml";
const CONFIG_EXAMPLE_PATH: &str = "./config-example.toml";

fn main() {
    init_logger();
    if let Err(err) = run() {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn init_logger() {
    let log_config = ConfigBuilder::new()
        .add_filter_ignore_str("tungstenite")
        .build();
    if TermLogger::init(LevelFilter::Debug, log_config, TerminalMode::Mixed, ColorChoice::Auto).is_err() {
        eprintln!("Logger already initialized");
    }
    set_debug(env::var("DEBUG").map_or(false, |v| v == "1"));
}

fn set_debug(enabled: bool) {
    log::set_max_level(if enabled { LevelFilter::Debug } else { LevelFilter::Info });
}

fn run() -> Result<()> {
    let config = config::load_config(Path::new(CONFIG_PATH), Path::new(CONFIG_EXAMPLE_PATH))?;
    if config.debug {
        set_debug(true);
    }
    info!("Config loaded ({} dialers, {} line configs)", config.dialers.len(), config.lines.len());

    let listen = config.listen.clone();
    let secret = config.secret.clone();
    let assets = CallerIdAssets::load(&config.modem)?;
    let exchange = Exchange::new(config, assets);

    // Output streams stop when dropped, so they live for the rest of `run`.
    let _streams = open_lines(&exchange)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Shutting down");
        flag.store(false, Ordering::SeqCst);
    }).map_err(|err| Error::Server(err.to_string()))?;

    ControlServer::bind(&listen, exchange, secret)?.run(&running)
}

/// Opens every attached adapter, adds it to the exchange and starts its polling thread.
fn open_lines(exchange: &SharedExchange) -> Result<Vec<rodio::OutputStream>> {
    let api = HidApi::new()?;
    let mut streams = Vec::new();

    for info in api.device_list().filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID) {
        let Some(serial) = info.serial_number().map(str::to_owned) else {
            warn!("Skipping adapter at {:?} without a serial number", info.path());
            continue
        };
        let device = info.open_device(&api)?;
        let (protocol, initial) = match hid::detect(&device) {
            Ok(detected) => detected,
            Err(err) => {
                error!("[{}] {}", serial, err);
                continue
            }
        };

        let audio = Arc::new(AudioPipeline::new());
        match audio::open_output(&serial, Arc::clone(&audio)) {
            Ok(stream) => streams.push(stream),
            Err(err) => {
                error!("{}", err);
                continue
            }
        }

        let (tx, rx) = mpsc::channel();
        let device_ids = audio::resolve_device_ids(&serial);
        let id = lock(exchange).add_line(&serial, protocol, device_ids, audio, tx);

        let poller = LinePoller::new(serial.clone(), Box::new(device), protocol, rx);
        let exchange = Arc::clone(exchange);
        thread::Builder::new()
            .name(format!("line-{}", serial))
            .spawn(move || {
                if let Err(err) = poller.run(initial, |report| lock(&exchange).on_hid_change(id, report)) {
                    error!("[{}] Line stopped: {}", serial, err);
                }
            })
            .map_err(|err| Error::DeviceIo(err.to_string()))?;
    }

    if streams.is_empty() {
        warn!("No adapters found");
    }
    Ok(streams)
}
