//! Keystone cluster-crash simulator: builds a synthetic cluster, crashes
//! masters one round at a time, and plays the recovery-master role by
//! answering recover requests, so the whole recovery control plane runs
//! end to end inside one process.

use std::process::ExitCode;
use std::sync::Arc;

use bytes::Bytes;

use clap::Parser;

use env_logger::Env;

use keystone::{
    ks_error, ks_info, ks_warn, CoordinatorServerList, KeystoneError,
    LogPosition, MasterRecoveryManager, ServerId, Tablet, TabletMap,
    TabletStatus, Will,
};

use rand::prelude::*;

use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of masters in the synthetic cluster.
    #[arg(short = 'n', long, default_value_t = 5)]
    masters: u64,

    /// Number of tables.
    #[arg(short, long, default_value_t = 4)]
    tables: u64,

    /// Tablets per table.
    #[arg(long, default_value_t = 8)]
    tablets_per_table: u64,

    /// Partitions per will.
    #[arg(short, long, default_value_t = 3)]
    partitions: usize,

    /// Number of crash rounds to simulate (0 = until interrupted).
    #[arg(short, long, default_value_t = 3)]
    rounds: usize,

    /// Probability that a recovery master fails its partitions.
    #[arg(short, long, default_value_t = 0.1)]
    fail_rate: f64,

    /// Maximum number of concurrent recoveries.
    #[arg(long, default_value_t = 1)]
    max_active: usize,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(())` on success or
    /// `Err(KeystoneError)` on any error.
    fn sanitize(&self) -> Result<(), KeystoneError> {
        if self.masters < 2 {
            Err(KeystoneError(format!(
                "invalid number of masters {}",
                self.masters
            )))
        } else if self.tables == 0 || self.tablets_per_table == 0 {
            Err(KeystoneError(format!(
                "invalid table layout {}x{}",
                self.tables, self.tablets_per_table
            )))
        } else if self.partitions == 0 {
            Err(KeystoneError(format!(
                "invalid number of partitions {}",
                self.partitions
            )))
        } else if !(0.0..1.0).contains(&self.fail_rate) {
            Err(KeystoneError(format!(
                "invalid fail_rate {}",
                self.fail_rate
            )))
        } else if self.max_active == 0 {
            Err(KeystoneError(format!(
                "invalid max_active {}",
                self.max_active
            )))
        } else if self.threads < 2 {
            Err(KeystoneError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Builds a will from the given tablets, spreading them round-robin over
/// `partitions` partitions, and serializes it.
fn build_will(
    tablets: &[Tablet],
    partitions: usize,
) -> Result<Bytes, KeystoneError> {
    let mut will = Will::new();
    let num_partitions = partitions.min(tablets.len().max(1));
    for (index, tablet) in tablets.iter().enumerate() {
        will.add_tablet(index % num_partitions, tablet.clone())?;
    }
    Ok(Bytes::from(encode_to_vec(&will)?))
}

/// Populates the tablet map with an even spread of tablets over all
/// masters and enlists every master with a matching will.
fn build_cluster(
    args: &CliArgs,
    server_list: &CoordinatorServerList,
    tablet_map: &TabletMap,
) -> Result<(), KeystoneError> {
    let range_width = u64::MAX / args.tablets_per_table;
    for table_id in 0..args.tables {
        for index in 0..args.tablets_per_table {
            let owner = (table_id * args.tablets_per_table + index)
                % args.masters
                + 1;
            let start_key_hash = index * range_width;
            let end_key_hash = if index == args.tablets_per_table - 1 {
                u64::MAX
            } else {
                (index + 1) * range_width - 1
            };
            tablet_map.add_tablet(Tablet {
                table_id,
                start_key_hash,
                end_key_hash,
                server_id: ServerId(owner),
                status: TabletStatus::Normal,
                ctime: LogPosition::default(),
            });
        }
    }

    for master in 1..=args.masters {
        let owned = tablet_map.tablets_owned_by(ServerId(master));
        server_list.add(
            ServerId(master),
            &format!("tcp:10.0.0.{}", master),
            build_will(&owned, args.partitions)?,
            1,
        )?;
    }
    Ok(())
}

/// Runs crash rounds until the requested count is reached, too few masters
/// survive, or a termination signal arrives.
async fn run_sim(
    args: CliArgs,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), KeystoneError> {
    let (server_list, mut rx_broadcast) = CoordinatorServerList::new();
    let server_list = Arc::new(server_list);
    let tablet_map = Arc::new(TabletMap::new());
    build_cluster(&args, &server_list, &tablet_map)?;
    ks_info!(
        "crashsim";
        "cluster built: {} masters, {} tablets",
        args.masters,
        tablet_map.len()
    );

    let config = format!("max_active_recoveries = {}", args.max_active);
    let (mut mrm, mut rx_recover) = MasterRecoveryManager::new_and_setup(
        server_list.clone(),
        tablet_map.clone(),
        Some(&config),
    )?;
    mrm.start();

    let mut rng = rand::thread_rng();
    let mut live: Vec<u64> = (1..=args.masters).collect();
    let mut round = 0;
    let mut interrupted = false;

    while (args.rounds == 0 || round < args.rounds)
        && live.len() >= 2
        && !interrupted
    {
        round += 1;
        let victim =
            ServerId(live.remove(rng.gen_range(0..live.len())));
        ks_info!("crashsim"; "round {}: crashing master {}", round, victim);
        let had_tablets = !tablet_map.tablets_owned_by(victim).is_empty();
        server_list.server_crashed(victim)?;
        mrm.start_master_recovery(victim)?;
        if !had_tablets {
            // nothing to recover, so no membership update will follow
            continue;
        }

        // answer recover requests as the chosen recovery masters would,
        // until the victim has been retired from the membership
        loop {
            tokio::select! {
                _ = rx_term.changed() => {
                    ks_warn!("crashsim"; "caught termination signal");
                    interrupted = true;
                    break;
                },

                Some(request) = rx_recover.recv() => {
                    let successful = rng.gen_bool(1.0 - args.fail_rate);
                    let log_head = LogPosition {
                        segment_id: request.min_open_segment_id + 1,
                        offset: 0,
                    };
                    let recovered: Vec<Tablet> = if successful {
                        request
                            .tablets
                            .iter()
                            .map(|t| Tablet {
                                server_id: request.recovery_master_id,
                                status: TabletStatus::Normal,
                                ctime: log_head,
                                ..t.clone()
                            })
                            .collect()
                    } else {
                        ks_warn!(
                            "crashsim";
                            "master {} failing its partitions on purpose",
                            request.recovery_master_id
                        );
                        Vec::new()
                    };
                    mrm.recovery_master_finished(
                        request.recovery_id,
                        request.recovery_master_id,
                        recovered,
                        successful,
                    )?;
                    if successful {
                        server_list.set_min_open_segment_id(
                            request.recovery_master_id,
                            log_head.segment_id,
                        )?;
                    }
                },

                Some(broadcast) = rx_broadcast.recv() => {
                    ks_info!(
                        "crashsim";
                        "membership now at v{}, {} removed, {} notified",
                        broadcast.update.version,
                        broadcast.update.removed.len(),
                        broadcast.recipients.len()
                    );
                    break; // the victim has been retired
                },
            }
        }

        // masters absorbed recovered tablets; refresh their wills
        for master in live.iter() {
            let owned = tablet_map.tablets_owned_by(ServerId(*master));
            server_list.set_will(
                ServerId(*master),
                build_will(&owned, args.partitions)?,
            )?;
        }
    }

    mrm.quiesce().await?;
    mrm.halt().await?;
    let live_tablets: usize = live
        .iter()
        .map(|&master| tablet_map.tablets_owned_by(ServerId(master)).len())
        .sum();
    ks_info!(
        "crashsim";
        "simulated {} crash rounds; {} masters live owning {} of {} tablets",
        round,
        live.len(),
        live_tablets,
        tablet_map.len()
    );
    Ok(())
}

/// Actual main function of the crash simulator.
fn crashsim_main() -> Result<(), KeystoneError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            ks_error!("crashsim"; "error sending to term channel: {}", e);
        }
    })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-crashsim")
        .build()?;

    // enter tokio runtime and drive the simulation
    runtime.block_on(async move {
        run_sim(args, rx_term).await?;
        Ok::<(), KeystoneError>(()) // give type hint for this async closure
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(ref e) = crashsim_main() {
        ks_error!("crashsim"; "crashsim_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod crashsim_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() {
        let args = CliArgs {
            masters: 5,
            tables: 4,
            tablets_per_table: 8,
            partitions: 3,
            rounds: 3,
            fail_rate: 0.1,
            max_active: 1,
            threads: 2,
        };
        assert!(args.sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid() {
        let args = CliArgs {
            masters: 1,
            tables: 4,
            tablets_per_table: 8,
            partitions: 3,
            rounds: 3,
            fail_rate: 0.1,
            max_active: 1,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }
}
