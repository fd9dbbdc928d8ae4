use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("rentd")
        .user("rentd")
        .password(std::env::var("RENTD_PASSWORD").unwrap_or_else(|_| "rentd".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() + Days::new(offset)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn create_listing(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO listings (id, name, description, location, price_per_night) \
             VALUES ('{id}', 'Bench flat', 'Benchmark listing', 'Nowhere', 99.99)"
        ))
        .await
        .unwrap();
    id
}

fn insert_booking(listing: Ulid, start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "INSERT INTO bookings (listing_id, start_date, end_date) \
         VALUES ('{listing}', '{start}', '{end}')"
    )
}

/// Active stays of a listing as (start, end) date strings.
async fn active_stays(client: &tokio_postgres::Client, listing: Ulid) -> Vec<(String, String)> {
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE listing_id = '{listing}' \
             AND status IN ('pending', 'confirmed')"
        ))
        .await
        .unwrap();
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some((
                r.get("start_date").unwrap_or_default().to_string(),
                r.get("end_date").unwrap_or_default().to_string(),
            )),
            _ => None,
        })
        .collect()
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let listing = create_listing(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // Back-to-back two-night stays: every insert must succeed.
    for i in 0..n as u64 {
        let t = Instant::now();
        client
            .batch_execute(&insert_booking(listing, day(i * 2), day(i * 2 + 2)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let listing = create_listing(&setup).await;

    let n_tasks = 20;
    let attempts_per_task = 100u64;
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for j in 0..attempts_per_task {
                // Overlapping three-night stays, shifted per task.
                let s = day(j * 2 + (t % 3));
                let e = s + Days::new(3);
                match client.batch_execute(&insert_booking(listing, s, e)).await {
                    Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let ok = accepted.load(Ordering::Relaxed);
    let refused = rejected.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks, {} attempts: {ok} accepted, {refused} rejected in {:.2}s",
        n_tasks as u64 * attempts_per_task,
        elapsed.as_secs_f64()
    );

    let mut stays = active_stays(&setup, listing).await;
    stays.sort();
    let overlaps = stays.windows(2).filter(|w| w[1].0 < w[0].1).count();
    assert_eq!(stays.len(), ok, "accepted count differs from stored bookings");
    assert_eq!(overlaps, 0, "found {overlaps} overlapping active stays");
    println!("  verified {} active stays, no overlaps", stays.len());
}

async fn phase3_quotes_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let listing = create_listing(&setup).await;
    for i in 0..200u64 {
        setup
            .batch_execute(&insert_booking(listing, day(i * 3), day(i * 3 + 2)))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let own = create_listing(&client).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&insert_booking(own, day(i), day(i + 1)))
                    .await;
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
            for q in 0..reads_per_reader as u64 {
                let s = day((q * 7 + r) % 600);
                let e = s + Days::new(4);
                let t = Instant::now();
                // Conflicts are an expected answer here.
                let _ = client
                    .simple_query(&format!(
                        "SELECT * FROM quote WHERE listing_id = '{listing}' \
                         AND start_date = '{s}' AND end_date = '{e}'"
                    ))
                    .await;
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

    print_latency("quote query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let listing = create_listing(&client).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&insert_booking(listing, day(i), day(i + 1)))
                    .await
                    .unwrap();
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
    let host = std::env::var("RENTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RENTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RENTD_PORT");

    println!("=== rentd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended overlapping writes");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] quote latency under write load");
    phase3_quotes_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
