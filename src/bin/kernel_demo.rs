//! Single-Server Queue Demo for the Discrete-Event Kernel
//!
//! A generator process emits customers at pseudo-random intervals; each
//! customer waits on a condition until the server is free, holds it for a
//! service time, then leaves.
//!
//! Usage:
//!   cargo run --bin kernel_demo                          # Offline, as fast as possible
//!   cargo run --bin kernel_demo -- --realtime 4.0        # Paced at 4x wall-clock speed
//!   cargo run --bin kernel_demo -- --customers 50 --until 2000 --seed 7
//!
//! Set RUST_LOG=info (or debug/trace) to follow the simulation.

use des_kernel::{
    target_fn, Priority, ProcessTarget, Scheduler, SchedulerConfig, Tick, TraceListener,
};
use std::cell::Cell;
use std::env;
use std::rc::Rc;

/// xorshift64*; enough to vary arrivals reproducibly.
struct XorShift(u64);

impl XorShift {
    fn range(&mut self, lo: Tick, hi: Tick) -> Tick {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        let v = self.0.wrapping_mul(0x2545f4914f6cdd1d);
        lo + (v % (hi - lo + 1) as u64) as Tick
    }
}

#[derive(Default)]
struct Shop {
    busy: Cell<bool>,
    queued: Cell<usize>,
    served: Cell<usize>,
    total_wait: Cell<Tick>,
    longest_queue: Cell<usize>,
}

#[derive(Default)]
struct EventCounter {
    dispatched: Cell<u64>,
    evaluations: Cell<u64>,
}

impl TraceListener for EventCounter {
    fn trace_event(&self, tick: Tick, priority: Priority, description: &str) {
        self.dispatched.set(self.dispatched.get() + 1);
        log::trace!("({}, {}) {}", tick, priority, description);
    }

    fn trace_conditional_eval(&self, _description: &str) {
        self.evaluations.set(self.evaluations.get() + 1);
    }
}

fn customer(shop: Rc<Shop>, n: usize, service: Tick) -> Rc<dyn ProcessTarget> {
    target_fn(format!("customer {}", n), move |ctx| {
        let shop = shop.clone();
        async move {
            let arrived = ctx.tick()?;
            log::info!("t={} customer {} arrives", arrived, n);

            // Several waiters can see the server free in one evaluation;
            // whoever runs first takes it and the rest wait again.
            if shop.busy.get() {
                shop.queued.set(shop.queued.get() + 1);
                shop.longest_queue
                    .set(shop.longest_queue.get().max(shop.queued.get()));
                while shop.busy.get() {
                    let s = shop.clone();
                    ctx.wait_until(move || !s.busy.get(), None).await?;
                }
                shop.queued.set(shop.queued.get() - 1);
            }

            shop.busy.set(true);
            let start = ctx.tick()?;
            shop.total_wait.set(shop.total_wait.get() + (start - arrived));
            log::info!("t={} customer {} served after waiting {}", start, n, start - arrived);

            ctx.wait_ticks(service, 0, true, None).await?;

            shop.busy.set(false);
            shop.served.set(shop.served.get() + 1);
            log::info!("t={} customer {} leaves", ctx.tick()?, n);
            Ok(())
        }
    })
}

fn generator(shop: Rc<Shop>, customers: usize, seed: u64) -> Rc<dyn ProcessTarget> {
    target_fn("generator", move |ctx| {
        let shop = shop.clone();
        async move {
            let mut rng = XorShift(seed.max(1));
            for n in 0..customers {
                let service = rng.range(2, 9);
                ctx.schedule_ticks(0, 1, true, customer(shop.clone(), n, service), None)?;
                ctx.wait_ticks(rng.range(3, 8), 0, true, None).await?;
            }
            log::info!("t={} generator done", ctx.tick()?);
            Ok(())
        }
    })
}

fn print_usage() {
    println!("Single-server queue on the discrete-event kernel");
    println!();
    println!("Usage: kernel_demo [--customers N] [--until TICKS] [--seed S] [--realtime FACTOR]");
    println!();
    println!("  --customers, -c   Number of customers to generate (default 20)");
    println!("  --until, -u       Stop the clock at this tick (default: run to completion)");
    println!("  --seed, -s        Seed for arrival and service times (default 42)");
    println!("  --realtime, -r    Pace against wall time; 1 tick = 10 ms simulated");
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    let mut customers = 20usize;
    let mut until = Tick::MAX;
    let mut seed = 42u64;
    let mut real_time: Option<f64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--customers" | "-c" => {
                i += 1;
                if i < args.len() {
                    customers = args[i].parse()?;
                }
            }
            "--until" | "-u" => {
                i += 1;
                if i < args.len() {
                    until = args[i].parse()?;
                }
            }
            "--seed" | "-s" => {
                i += 1;
                if i < args.len() {
                    seed = args[i].parse()?;
                }
            }
            "--realtime" | "-r" => {
                i += 1;
                real_time = Some(args.get(i).and_then(|a| a.parse().ok()).unwrap_or(1.0));
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => anyhow::bail!("unknown argument '{}'", other),
        }
        i += 1;
    }

    let sched = Scheduler::new(SchedulerConfig {
        name: "shop".into(),
        tick_length: 0.01,
        real_time: real_time.is_some(),
        real_time_factor: real_time.unwrap_or(1.0),
        ..SchedulerConfig::default()
    });
    let counter = Rc::new(EventCounter::default());
    sched.set_trace_listener(Some(counter.clone()));

    let shop = Rc::new(Shop::default());
    sched.schedule_external(0, 0, true, generator(shop.clone(), customers, seed), None)?;

    println!("Running {} customers (seed {})...", customers, seed);
    sched.resume(until);

    if let Some(failure) = sched.take_failure() {
        return Err(failure.context("simulation halted"));
    }

    let served = shop.served.get();
    println!();
    println!("Stopped at tick {} ({:.2} s simulated)", sched.current_tick(), sched.seconds());
    println!("  served:          {}/{}", served, customers);
    if served > 0 {
        println!(
            "  mean wait:       {:.2} ticks",
            shop.total_wait.get() as f64 / served as f64
        );
    }
    println!("  longest queue:   {}", shop.longest_queue.get());
    println!("  events run:      {}", counter.dispatched.get());
    println!("  condition evals: {}", counter.evaluations.get());
    println!("  contexts:        {}", sched.pool_size());
    if sched.is_real_time() {
        println!("  paced at:        {}x wall clock", real_time.unwrap_or(1.0));
    }
    if sched.has_pending_event() || sched.conditional_count() > 0 {
        println!("  still pending:   {:?}", sched.event_data_list());
    }

    Ok(())
}
