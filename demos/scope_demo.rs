//! A small bank-style workload: a few worker threads move money between
//! accounts under traced scopes, then the trace document goes to stdout.
//!
//! Run with `RUST_LOG=debug` to see thread registration as it happens.

use std::alloc::System;
use std::sync::{Arc, Mutex};

use scopetrace::trace_scope;

#[global_allocator]
static GLOBAL: scopetrace::TraceAlloc<System> = scopetrace::TraceAlloc::new(System);

struct Bank {
    accounts: Vec<i64>,
}

impl Bank {
    fn new(count: usize) -> Self {
        Self {
            accounts: vec![1_000; count],
        }
    }

    fn transfer(&mut self, from: usize, to: usize, amount: i64) {
        trace_scope!("transfer");
        self.accounts[from] -= amount;
        self.accounts[to] += amount;
        // Some heap churn so the allocation columns have something to show.
        let receipt = format!("moved {amount} from {from} to {to}");
        std::hint::black_box(&receipt);
    }

    fn audit(&self) -> i64 {
        trace_scope!("audit");
        self.accounts.iter().sum()
    }
}

fn run_teller(bank: &Arc<Mutex<Bank>>, seed: usize) {
    trace_scope!("teller_shift");
    for round in 0..200 {
        let mut bank = bank.lock().unwrap();
        let count = bank.accounts.len();
        bank.transfer((seed + round) % count, (seed * 7 + round) % count, 25);
    }
}

fn main() {
    env_logger::init();
    scopetrace::enable();

    let bank = Arc::new(Mutex::new(Bank::new(8)));
    // A traced value: every tracked access shows up as its own scope.
    let mut journal = scopetrace::traced!("journal", Vec::<String>::new());

    {
        trace_scope!("business_day");
        let tellers: Vec<_> = (0..3)
            .map(|seed| {
                let bank = Arc::clone(&bank);
                std::thread::Builder::new()
                    .name(format!("teller-{seed}"))
                    .spawn(move || run_teller(&bank, seed))
                    .expect("spawn teller")
            })
            .collect();
        for teller in tellers {
            teller.join().expect("teller panicked");
        }

        let total = bank.lock().unwrap().audit();
        journal.track_mut().push(format!("closing balance {total}"));
        assert_eq!(total, 8 * 1_000, "transfers conserve money");
    }

    match scopetrace::dump_json() {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("trace dump failed: {err}"),
    }
}
