//! Execute a block of random transfers in parallel and check it against a sequential run.

use bytes::Bytes;
use clap::{value_parser, Arg, Command};
use mvs_rs::executor::{Config, Executor};
use mvs_rs::memdb::MemDb;
use mvs_rs::types::{Store, TxnIndex, Vm};
use mvs_rs::vistore::VersionIndexedStore;
use mvs_rs::Error;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const INITIAL_BALANCE: u64 = 1_000;

struct Transfers(Vec<(u32, u32, u64)>);

fn account(id: u32) -> Bytes {
    Bytes::from(format!("balance/{id:08}"))
}

fn decode(value: Option<Bytes>) -> Result<u64, Error> {
    let Some(value) = value else {
        return Ok(0);
    };
    let bytes: [u8; 8] = value
        .as_ref()
        .try_into()
        .map_err(|_| Error::Storage(format!("malformed balance: {value:?}")))?;
    Ok(u64::from_be_bytes(bytes))
}

impl<S: Store> Vm<S> for Transfers {
    type Output = bool;

    fn execute(&self, index: TxnIndex, store: &VersionIndexedStore<S>) -> Result<bool, Error> {
        let (from, to, amount) = self.0[index];
        let balance = decode(store.get(&account(from))?)?;
        if balance < amount {
            return Ok(false);
        }
        store.set(account(from), Bytes::copy_from_slice(&(balance - amount).to_be_bytes()))?;
        let receiver = decode(store.get(&account(to))?)?;
        store.set(account(to), Bytes::copy_from_slice(&(receiver + amount).to_be_bytes()))?;
        Ok(true)
    }
}

fn genesis(accounts: u32) -> Arc<MemDb> {
    Arc::new(
        (0..accounts)
            .map(|id| (account(id), Bytes::copy_from_slice(&INITIAL_BALANCE.to_be_bytes())))
            .collect(),
    )
}

fn command() -> Command {
    Command::new("mvs-rs")
        .about("execute a block of random transfers with optimistic concurrency control")
        .arg(
            Arg::new("transactions")
                .long("transactions")
                .default_value("10000")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("accounts")
                .long("accounts")
                .default_value("100")
                .value_parser(value_parser!(u32).range(1..))
                .help("Fewer accounts means more conflicts"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .default_value("8")
                .value_parser(value_parser!(NonZeroUsize)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
}

fn main() {
    // Parse arguments
    let matches = command().get_matches();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let transactions = *matches.get_one::<usize>("transactions").unwrap();
    let accounts = *matches.get_one::<u32>("accounts").unwrap();
    let concurrency = *matches.get_one::<NonZeroUsize>("concurrency").unwrap();
    let seed = *matches.get_one::<u64>("seed").unwrap();

    // Generate block
    let mut rng = StdRng::seed_from_u64(seed);
    let txs: Vec<(u32, u32, u64)> = (0..transactions)
        .map(|_| {
            (
                rng.gen_range(0..accounts),
                rng.gen_range(0..accounts),
                rng.gen_range(0..INITIAL_BALANCE),
            )
        })
        .collect();
    info!(transactions, accounts, seed, "generated block");

    // Sequential baseline
    let sequential = genesis(accounts);
    let start = Instant::now();
    let expected = Executor::new(
        Config {
            concurrency: NonZeroUsize::MIN,
        },
        Transfers(txs.clone()),
        sequential.clone(),
        txs.len(),
    )
    .run_sequential()
    .expect("sequential execution failed");
    info!(elapsed = ?start.elapsed(), "sequential execution");

    // Parallel execution
    let parallel = genesis(accounts);
    let start = Instant::now();
    let outputs = Executor::new(
        Config { concurrency },
        Transfers(txs),
        parallel.clone(),
        expected.len(),
    )
    .run()
    .expect("parallel execution failed");
    info!(concurrency = concurrency.get(), elapsed = ?start.elapsed(), "parallel execution");

    assert_eq!(outputs, expected, "outputs differ from sequential execution");
    assert_eq!(
        parallel.snapshot(),
        sequential.snapshot(),
        "state differs from sequential execution"
    );
    let succeeded = outputs.iter().filter(|ok| **ok).count();
    info!(succeeded, failed = outputs.len() - succeeded, "state matches sequential execution");
}
