use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use quire_codec::{decode_all, diff, encode_all, encode_snapshot, decode_snapshot, Diff};
use quire_doc::{BlockKind, DocumentEngine, MarkType, Operation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DOCUMENT: &str = "stress";

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_replicas: usize,
    pub operations_per_replica: usize,
    pub total_syncs: usize,
    pub updates_shipped: usize,
    pub bytes_shipped: usize,
    pub snapshot_fallbacks: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>38} ║", self.num_replicas);
        println!("║  Operations per Replica:    {:>38} ║", self.operations_per_replica);
        println!("║  Total Sync Operations:     {:>38} ║", self.total_syncs);
        println!("║  Updates Shipped:           {:>38} ║", self.updates_shipped);
        println!("║  Bytes Shipped:             {:>38} ║", self.bytes_shipped);
        println!("║  Snapshot Fallbacks:        {:>38} ║", self.snapshot_fallbacks);
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>36}µs ║", format!("{:.2}", self.avg_sync_time.as_micros()));
        println!("║  Operations/Second:         {:>38.0} ║", self.ops_per_second);
        println!("║  Converged:                 {:>38} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Generator that yields replica indices for synchronization patterns
fn replica_sync_generator(num_replicas: usize, num_syncs: usize) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_syncs {
            let replica_a = rng.gen_range(0..num_replicas);
            let replica_b = rng.gen_range(0..num_replicas);
            yield (replica_a, replica_b);
        }
    }
}

/// A random edit against what `engine` currently shows.
fn random_operation(engine: &DocumentEngine, rng: &mut StdRng, replica: usize) -> Operation {
    let rendered = engine.render();
    if rendered.blocks.is_empty() || rng.gen_bool(0.05) {
        let after = if rendered.blocks.is_empty() {
            None
        } else {
            Some(rendered.blocks[rng.gen_range(0..rendered.blocks.len())].id.clone())
        };
        return Operation::InsertBlock {
            after,
            kind: BlockKind::Paragraph,
        };
    }

    let block = &rendered.blocks[rng.gen_range(0..rendered.blocks.len())];
    let len = block.text().chars().count();
    let roll: f64 = rng.gen();
    if roll < 0.6 || len == 0 {
        let text = format!("{}", (b'a' + (replica % 26) as u8) as char).repeat(rng.gen_range(1..4));
        Operation::InsertText {
            block: block.id.clone(),
            offset: rng.gen_range(0..=len),
            text,
        }
    } else if roll < 0.8 {
        let offset = rng.gen_range(0..len);
        Operation::DeleteText {
            block: block.id.clone(),
            offset,
            len: rng.gen_range(1..=(len - offset).min(4)),
        }
    } else if roll < 0.9 {
        let offset = rng.gen_range(0..len);
        Operation::Format {
            block: block.id.clone(),
            offset,
            len: len - offset,
            mark: if rng.gen_bool(0.5) { MarkType::Bold } else { MarkType::Italic },
            enabled: rng.gen_bool(0.8),
        }
    } else if roll < 0.97 {
        let kinds = [
            BlockKind::Paragraph,
            BlockKind::Heading { level: 2 },
            BlockKind::BulletItem,
            BlockKind::Quote,
        ];
        Operation::SetBlockKind {
            block: block.id.clone(),
            kind: kinds[rng.gen_range(0..kinds.len())].clone(),
        }
    } else {
        Operation::DeleteBlock {
            block: block.id.clone(),
        }
    }
}

/// Ship what `to` is missing from `from` through the wire codec.
/// Returns (updates, bytes, used a snapshot).
fn ship(from: &DocumentEngine, to: &mut DocumentEngine) -> (usize, usize, bool) {
    let remote = to.state_vector();
    match diff(from.log(), from.state().state_vector(), &remote) {
        Diff::Updates(updates) => {
            let frames = match encode_all(&updates) {
                Ok(frames) => frames,
                Err(err) => {
                    warn!(%err, "encode failed");
                    return (0, 0, false);
                }
            };
            let bytes = frames.iter().map(Vec::len).sum();
            match decode_all(&frames) {
                Ok(decoded) => {
                    for update in decoded {
                        if let Err(err) = to.apply_remote(update) {
                            warn!(%err, "remote update rejected");
                        }
                    }
                }
                Err(err) => warn!(%err, "decode failed"),
            }
            (updates.len(), bytes, false)
        }
        Diff::FullState => {
            let snapshot = from.snapshot();
            let bytes = match encode_snapshot(&snapshot) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "snapshot encode failed");
                    return (0, 0, true);
                }
            };
            match decode_snapshot(&bytes) {
                Ok(state) => {
                    if let Err(err) = to.merge_snapshot(&state) {
                        warn!(%err, "snapshot merge failed");
                    }
                }
                Err(err) => warn!(%err, "snapshot decode failed"),
            }
            (0, bytes.len(), true)
        }
    }
}

#[derive(Default)]
struct SyncTally {
    times: Vec<Duration>,
    syncs: usize,
    updates: usize,
    bytes: usize,
    snapshots: usize,
}

/// Helper function to perform synchronization between two replicas
async fn perform_sync(
    replicas: &[Arc<Mutex<DocumentEngine>>],
    replica_a_idx: usize,
    replica_b_idx: usize,
    num_syncs: usize,
    tally: &mut SyncTally,
) {
    if replica_a_idx == replica_b_idx {
        return; // Skip self-sync
    }

    let sync_start = Instant::now();

    let replica_a = Arc::clone(&replicas[replica_a_idx]);
    let replica_b = Arc::clone(&replicas[replica_b_idx]);
    let (mut doc_a, mut doc_b) = tokio::join!(replica_a.lock(), replica_b.lock());

    let (updates_ab, bytes_ab, snap_ab) = ship(&doc_a, &mut doc_b);
    let (updates_ba, bytes_ba, snap_ba) = ship(&doc_b, &mut doc_a);

    drop(doc_a);
    drop(doc_b);

    tally.times.push(sync_start.elapsed());
    tally.syncs += 1;
    tally.updates += updates_ab + updates_ba;
    tally.bytes += bytes_ab + bytes_ba;
    tally.snapshots += usize::from(snap_ab) + usize::from(snap_ba);

    if tally.syncs % 100 == 0 {
        println!("  Syncs completed: {}/{}", tally.syncs, num_syncs);
    }
}

/// Random concurrent edits on every replica, interleaved with random
/// pairwise syncs, then a full ring sync and a convergence check.
pub async fn stress_test_documents(
    num_replicas: usize,
    ops_per_replica: usize,
    num_syncs: usize,
) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Document Stress Test (Async)                        ║");
    println!("║  Replicas: {} | Ops/Replica: {} | Syncs: {} ║",
             num_replicas, ops_per_replica, num_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();

    let replicas: Vec<Arc<Mutex<DocumentEngine>>> = (0..num_replicas)
        .map(|idx| Arc::new(Mutex::new(DocumentEngine::new(DOCUMENT, format!("replica-{idx:03}")))))
        .collect();

    println!("\n[Phase 1/3] Editing replicas concurrently...");

    let mut handles = vec![];
    for (idx, replica) in replicas.iter().enumerate() {
        let replica = Arc::clone(replica);
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut dropped = 0usize;
            for i in 0..ops_per_replica {
                let mut engine = replica.lock().await;
                let op = random_operation(&engine, &mut rng, idx);
                if engine.apply_local(op).is_err() {
                    dropped += 1;
                }
                drop(engine);

                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            if dropped > 0 {
                debug!(replica = idx, dropped, "local operations rejected");
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.await;
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Random pairwise syncs...");

    let mut tally = SyncTally::default();
    let mut sync_gen = Box::pin(replica_sync_generator(num_replicas, num_syncs));
    while let Some((replica_a_idx, replica_b_idx)) = sync_gen.next().await {
        perform_sync(&replicas, replica_a_idx, replica_b_idx, num_syncs, &mut tally).await;
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Ring sync and convergence check...");

    // Two passes around the ring spread everything to everyone
    for _ in 0..2 {
        for idx in 0..num_replicas {
            let next = (idx + 1) % num_replicas;
            perform_sync(&replicas, idx, next, num_syncs, &mut tally).await;
        }
    }

    let mut rendered = Vec::with_capacity(num_replicas);
    for replica in &replicas {
        rendered.push(replica.lock().await.render());
    }
    let converged = rendered.windows(2).all(|pair| pair[0] == pair[1]);
    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    let avg_sync_time = if !tally.times.is_empty() {
        tally.times.iter().sum::<Duration>() / tally.times.len() as u32
    } else {
        Duration::ZERO
    };
    let total_operations = (num_replicas * ops_per_replica) + tally.syncs;
    let ops_per_second = total_operations as f64 / total_time.as_secs_f64();

    StressTestStats {
        num_replicas,
        operations_per_replica: ops_per_replica,
        total_syncs: tally.syncs,
        updates_shipped: tally.updates,
        bytes_shipped: tally.bytes,
        snapshot_fallbacks: tally.snapshots,
        total_time,
        avg_sync_time,
        ops_per_second,
        converged,
    }
}

/// Stress runs at increasing replica counts
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) -> bool {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Documents vs Replicas             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;
    let mut current_replicas = step_size.max(2);
    while current_replicas <= max_replicas {
        let stats = stress_test_documents(current_replicas, 50, current_replicas * 20).await;
        stats.print();
        all_converged &= stats.converged;
        current_replicas += step_size;
    }
    all_converged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_run_converges() {
        let stats = stress_test_documents(3, 40, 30).await;
        assert!(stats.converged);
        assert!(stats.total_syncs >= 6);
    }
}
