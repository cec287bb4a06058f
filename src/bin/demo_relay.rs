// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_relay [seconds] [channel]
//
// Run several copies side by side. Each one joins the shared registry, gets a
// channel, and publishes a slowly drifting tuning table plus a few notes. The
// elected leader logs what it would forward to the tuning driver. Kill the
// leader (or let it time out) and watch another copy take over.
//
// With [channel] the process moves to that channel after a few seconds.
// Set RUST_LOG=mts_relay=debug for more detail.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use mts_relay::{
    equal_temperament, FrequencyTable, Instance, MasterBusy, NoteRecord, OsLiveness, RelayConfig,
    SlotIndex, TuningInterface, CHANNEL_COUNT,
};

static QUIT: AtomicBool = AtomicBool::new(false);

/// Stands in for the device driver: logs instead of retuning anything.
struct LoggingTuning;

impl TuningInterface for LoggingTuning {
    fn register_as_master(&self) -> Result<(), MasterBusy> {
        tracing::info!("driver: registered as master");
        Ok(())
    }

    fn deregister_master(&self) {
        tracing::info!("driver: deregistered");
    }

    fn set_channel_relay_enabled(&self, channel: SlotIndex, enabled: bool) {
        tracing::info!(channel, enabled, "driver: relay state");
    }

    fn set_channel_tuning_table(&self, channel: SlotIndex, freqs: &FrequencyTable) {
        tracing::info!(channel, a4 = format_args!("{:.3}", freqs[69]), "driver: tuning table");
    }
}

fn detuned(cents: f64) -> FrequencyTable {
    let ratio = 2f64.powf(cents / 1200.0);
    let base = equal_temperament();
    std::array::from_fn(|n| base[n] * ratio)
}

fn install_signal_handlers() {
    extern "C" fn handler(_: libc::c_int) {
        QUIT.store(true, Ordering::Release);
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let args: Vec<String> = std::env::args().collect();
    let seconds: u64 = match args.get(1).map(|s| s.parse()) {
        None => 30,
        Some(Ok(s)) => s,
        Some(Err(_)) => {
            eprintln!("usage: demo_relay [seconds] [channel]");
            std::process::exit(1);
        }
    };
    let target: Option<SlotIndex> = match args.get(2).map(|s| s.parse()) {
        None => None,
        Some(Ok(ch)) if ch < CHANNEL_COUNT => Some(ch),
        Some(_) => {
            eprintln!("channel must be 0..{CHANNEL_COUNT}");
            std::process::exit(1);
        }
    };

    install_signal_handlers();

    let instance = Instance::start(RelayConfig::default(), Arc::new(LoggingTuning), Arc::new(OsLiveness));
    if !instance.get_is_active() {
        eprintln!(
            "multi-instance support unavailable: {}",
            instance.get_error_message().unwrap_or_default()
        );
        std::process::exit(1);
    }
    println!(
        "joined as channel {:?}, leader: {}",
        instance.get_channel_index(),
        instance.is_leader()
    );

    let all: BTreeSet<SlotIndex> = (0..CHANNEL_COUNT).collect();
    let started = Instant::now();
    let mut moved = false;
    let mut tick = 0u64;
    while !QUIT.load(Ordering::Acquire) && started.elapsed() < Duration::from_secs(seconds) {
        tick += 1;
        let cents = (tick % 100) as f64 - 50.0;
        if let Err(e) = instance.update_freqs(&detuned(cents)) {
            eprintln!("update_freqs: {e}");
        }

        let channel = instance.get_channel_index().unwrap_or(0) as u8;
        let root = 48 + (tick % 24) as u8;
        let notes: Vec<NoteRecord> = [root, root + 4, root + 7]
            .into_iter()
            .map(|note| NoteRecord {
                frequency: equal_temperament()[note as usize],
                amplitude: 0.5,
                note,
                velocity: 96,
                channel,
            })
            .collect();
        if let Err(e) = instance.update_notes(&notes) {
            eprintln!("update_notes: {e}");
        }

        if let Some(ch) = target.filter(|_| !moved && started.elapsed() > Duration::from_secs(3)) {
            moved = true;
            match instance.change_channel(ch) {
                Ok(()) => println!("moved to channel {ch}, leader: {}", instance.is_leader()),
                Err(e) => eprintln!("change_channel: {e}"),
            }
        }

        if tick % 10 == 0 {
            let sounding = instance.get_channels_notes(&all).map(|n| n.len()).unwrap_or(0);
            println!(
                "channel {:?} leader={} notes sounding across all channels: {sounding}",
                instance.get_channel_index(),
                instance.is_leader()
            );
        }
        if !instance.get_is_active() {
            eprintln!("deactivated: {}", instance.get_error_message().unwrap_or_default());
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    instance.shutdown();
    println!("left the registry");
}
