use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use clap::Parser;
use modal_monitor::{prelude::*, sync::lockword::ModalLockword};

#[derive(Parser, Debug)]
#[command(name = "modal-monitor", about = "Contention workload for modal object monitors")]
struct Args {
    #[command(flatten)]
    options: Options,

    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Lock/unlock pairs per worker.
    #[arg(long, default_value_t = 10_000)]
    iterations: u64,

    /// Objects the workers contend on.
    #[arg(long, default_value_t = 8)]
    objects: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let scheme = Arc::new(ModalMonitorScheme::from_options(&args.options));
    println!(
        "scheme {:?}, {:?} lock words, {} workers",
        scheme.kind(),
        scheme.layout(),
        args.threads
    );

    let objects: Arc<Vec<ObjectRef>> = Arc::new((0..args.objects.max(1)).map(|_| scheme.new_object()).collect());
    let counters: Arc<Vec<AtomicU64>> = Arc::new((0..objects.len()).map(|_| AtomicU64::new(0)).collect());
    let hashes: Vec<u32> = objects.iter().map(|o| scheme.make_hash_code(o)).collect();

    let start = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let scheme = scheme.clone();
            let objects = objects.clone();
            let counters = counters.clone();
            let iterations = args.iterations;
            std::thread::spawn(move || {
                for i in 0..iterations {
                    let slot = (worker + i as usize) % objects.len();
                    let object = &objects[slot];
                    scheme.monitor_enter(object);
                    // Load and store separately so lost updates show up.
                    let value = counters[slot].load(Ordering::Relaxed);
                    counters[slot].store(value + 1, Ordering::Relaxed);
                    if let Err(err) = scheme.monitor_exit(object) {
                        log::error!("worker {worker}: {err}");
                        return;
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        if worker.join().is_err() {
            eprintln!("worker panicked");
            std::process::exit(1);
        }
    }
    let elapsed = start.elapsed();

    let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    let expected = args.threads as u64 * args.iterations;
    println!("{total}/{expected} increments in {elapsed:?}");

    ping_pong(&scheme);

    let bound = objects
        .iter()
        .filter(|o| ModalLockword::from(o.header().read_misc()).is_bound())
        .count();
    scheme.collect_garbage();
    let stable = objects
        .iter()
        .zip(&hashes)
        .all(|(object, &hash)| scheme.make_hash_code(object) == hash);
    println!(
        "{bound} objects inflated before GC, {} free monitors after, hashcodes stable: {stable}",
        scheme.manager().unbound_count()
    );

    if total != expected || !stable {
        std::process::exit(1);
    }
}

/// Two threads hand a token back and forth with wait/notify.
fn ping_pong(scheme: &Arc<ModalMonitorScheme>) {
    const ROUNDS: u64 = 100;
    let lock = scheme.new_named_object("ping-pong");
    let turn = Arc::new(AtomicU64::new(0));

    let player = |parity: u64| {
        let scheme = scheme.clone();
        let lock = lock.clone();
        let turn = turn.clone();
        std::thread::spawn(move || -> MonitorResult {
            for _ in 0..ROUNDS {
                scheme.monitor_enter(&lock);
                while turn.load(Ordering::Relaxed) % 2 != parity {
                    scheme.monitor_wait(&lock, 0)?;
                }
                turn.fetch_add(1, Ordering::Relaxed);
                scheme.monitor_notify_all(&lock)?;
                scheme.monitor_exit(&lock)?;
            }
            Ok(())
        })
    };
    let players = [player(0), player(1)];
    for player in players {
        match player.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("ping-pong failed: {err}"),
            Err(_) => log::error!("ping-pong player panicked"),
        }
    }
    println!("ping-pong finished after {} turns", turn.load(Ordering::Relaxed));
}
