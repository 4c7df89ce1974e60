use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const WEEK: i64 = 7 * 24 * HOUR;
/// 2026-01-05T00:00:00Z, a Monday.
const BASE: i64 = 1_767_571_200_000;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("roombook")
        .user("roombook")
        .password(std::env::var("ROOMBOOK_PASSWORD").unwrap_or_else(|_| "roombook".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Register a fresh resource and account; the account books for a group
/// sharing its id. Returns (resource_id, account_id).
async fn register(client: &Client) -> (Ulid, Ulid) {
    let rid = Ulid::new();
    let account = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id) VALUES ('{rid}'); INSERT INTO accounts (id) VALUES ('{account}'); INSERT INTO groups (id) VALUES ('{account}');"
        ))
        .await
        .unwrap();
    (rid, account)
}

/// Create a pending request and return its id.
async fn create(client: &Client, rid: Ulid, owner: Ulid, start: i64, end: i64) -> Option<String> {
    let msgs = client
        .simple_query(&format!(
            r#"INSERT INTO requests (resource_id, owner_id, group_id, start, "end", title) VALUES ('{rid}', '{owner}', '{owner}', {start}, {end}, 'bench')"#
        ))
        .await
        .ok()?;
    msgs.into_iter().find_map(|m| match m {
        SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
        _ => None,
    })
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (rid, owner) = register(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = BASE + (i as i64) * HOUR;
        let t = Instant::now();
        create(&client, rid, owner, s, s + HOUR).await.expect("create failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} requests in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (rid, owner) = register(&client).await;
            for j in 0..n_per_task {
                let s = BASE + (j as i64) * HOUR;
                create(&client, rid, owner, s, s + HOUR).await.expect("create failed");
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} requests = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Shared resource: readers query the same calendar the writers extend
    let setup_client = connect(host, port).await;
    let (rid, owner) = register(&setup_client).await;
    for i in 0..200 {
        let s = BASE + (i as i64) * HOUR;
        create(&setup_client, rid, owner, s, s + HOUR).await.expect("create failed");
    }
    drop(setup_client);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = BASE + (w as i64 * 10_000 + i) * HOUR;
                let _ = create(&client, rid, owner, s, s + HOUR).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let week_of = BASE + ((r * reads_per_reader + k) % 2) as i64 * WEEK;
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM blocked_slots WHERE resource_id = '{rid}' AND week_of = '{week_of}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("blocked_slots query", &mut all_latencies);
}

async fn phase4_approval_contention(host: &str, port: u16) {
    let n_contenders = 20;

    let client = connect(host, port).await;
    let (rid, approver) = register(&client).await;
    let mut ids = Vec::with_capacity(n_contenders);
    for _ in 0..n_contenders {
        ids.push(create(&client, rid, approver, BASE, BASE + HOUR).await.expect("create failed"));
    }
    drop(client);

    let approved = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for id in ids {
        let host = host.to_string();
        let approved = approved.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let result = client
                .simple_query(&format!(
                    "INSERT INTO status_changes (request_id, status, actor_id) VALUES ('{id}', 'approval', '{approver}')"
                ))
                .await;
            if result.is_ok() {
                approved.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let won = approved.load(Ordering::Relaxed);
    println!(
        "  {n_contenders} approvals of one slot: {won} confirmed in {:.2}s{}",
        start.elapsed().as_secs_f64(),
        if won == 1 { "" } else { "  <-- expected exactly 1" }
    );
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (rid, owner) = register(&client).await;
            for i in 0..ops_per_conn {
                let s = BASE + (i as i64) * HOUR;
                create(&client, rid, owner, s, s + HOUR).await.expect("create failed");
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOMBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ROOMBOOK_PORT");

    println!("=== roombook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential request creation");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent request creation");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] blocked-slot latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] approval contention");
    phase4_approval_contention(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
