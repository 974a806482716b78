//! Linux shell for the Mullvad indicator.
//! Polls the VPN status in the background and prints the menu contents on
//! every change. Any line on stdin requests a refresh.

mod paths;
mod presenter;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use log::{error, info, warn};
use mullvad_indicator_core::config::Config;
use mullvad_indicator_core::model::{format_last_update, present};
use mullvad_indicator_core::{PollOutcome, PollScheduler, VpnStatusModel};

use crate::paths::LinuxPaths;
use crate::presenter::LogPresenter;

enum Message {
    Refresh,
    Quit,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("starting mullvad indicator (linux)");

    let config = match Config::load_with(&LinuxPaths) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let model = Arc::new(VpnStatusModel::new(
        config.runner(),
        config.argv(),
        config.timeout(),
    ));
    present(&model, &LogPresenter);
    let watch = model.subscribe(|model| present(model, &LogPresenter));

    let (tx, rx) = mpsc::channel();

    {
        let tx = tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received signal, shutting down");
            let _ = tx.send(Message::Quit);
        }) {
            error!("Error setting Ctrl-C handler: {e}");
            std::process::exit(1);
        }
    }
    spawn_stdin_reader(tx);

    let scheduler = PollScheduler::new(Arc::clone(&model));
    // Show a status right away instead of waiting a full interval.
    report(scheduler.trigger_now());
    if let Err(e) = scheduler.start(config.refresh_time) {
        error!("failed to start polling: {e}");
        std::process::exit(1);
    }

    run(&scheduler, rx);

    info!("exiting; stopping status polling");
    scheduler.stop();
    model.unsubscribe(watch);
}

fn run(scheduler: &PollScheduler, rx: Receiver<Message>) {
    info!("indicator ready; press Enter to refresh");

    while let Ok(message) = rx.recv() {
        match message {
            Message::Refresh => {
                report(scheduler.trigger_now());
                info!(
                    "last update: {}",
                    format_last_update(scheduler.model().last_success())
                );
            }
            Message::Quit => break,
        }
    }
}

fn report(outcome: PollOutcome) {
    match outcome {
        PollOutcome::Updated { .. } | PollOutcome::Discarded => {}
        PollOutcome::Skipped => info!("a status poll is already running"),
        PollOutcome::Failed(e) => warn!("status unavailable: {e}"),
    }
}

fn spawn_stdin_reader(tx: Sender<Message>) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || tx.send(Message::Refresh).is_err() {
                break;
            }
        }
    });
}
