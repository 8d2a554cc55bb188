use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::runtime::Builder;
use tracing::info;

mod gcode_store;
mod job;
mod objects;
mod oneway_websocket;
mod printer;
mod server_result;
mod util;
mod web;

use gcode_store::FsGcodeStore;
use util::console::ConsoleLog;

#[derive(Parser, Debug)]
#[command(version = "0.1.0", about = "Serve a Moonraker-style API for a Marlin printer on the given serial port.", long_about = None)]
struct Args {
    /// Serial port the printer is attached to, e.g. /dev/ttyUSB0.
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = 115200)]
    baud: u32,
    #[arg(short, long, default_value = "0.0.0.0:7125")]
    listen: String,
    /// Folder whose gcode/ subdirectory holds printable files.
    #[arg(short, long)]
    data_folder: String,
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    let runtime = Builder::new_multi_thread().enable_all().build().unwrap();
    runtime.block_on(async move {
        info!(port = %args.port, baud = args.baud, "starting printer bridge");
        let console = Arc::new(ConsoleLog::new(400));
        let port = args.port;
        let baud = args.baud;
        let printer = printer::start_printer(
            move || {
                let port = port.clone();
                async move { printer::connection::open_and_reset_serial(&port, baud).await }
            },
            console.clone(),
        );
        let store: Arc<dyn gcode_store::GcodeStore> = Arc::new(FsGcodeStore::new(
            PathBuf::from(args.data_folder).join("gcode"),
        ));
        let job = job::start_job_manager(printer.clone(), store.clone());
        let objects = objects::start_object_model(printer.watch(), job.watch());
        web::run_server(
            args.listen,
            web::AppState {
                printer,
                job,
                objects,
                store,
                console,
            },
        )
        .await;
    });
}
