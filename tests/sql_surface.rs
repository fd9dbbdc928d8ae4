use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use rentd::engine::Engine;
use rentd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("rentd.wal")).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "rentd".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("rentd")
        .user("rentd")
        .password("rentd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_listing(client: &tokio_postgres::Client, price: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO listings (id, name, description, location, price_per_night) \
             VALUES ('{id}', 'Loft', 'Sunny loft', 'Lisbon', {price})"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &tokio_postgres::Client, listing: Ulid, start: &str, end: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{id}', '{listing}', '{start}', '{end}')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_walkthrough() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "100").await;

    let first = book(&client, lid, "2025-06-01", "2025-06-05").await;
    let got = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{first}'")).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].get("total_price"), Some("400.00"));
    assert_eq!(got[0].get("status"), Some("pending"));

    // Overlaps the first stay by two nights.
    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) \
             VALUES ('{lid}', '2025-06-03', '2025-06-07')"
        ),
    )
    .await;
    assert_eq!(code, "23P01");

    // Checkout day is free for the next check-in.
    book(&client, lid, "2025-06-05", "2025-06-08").await;

    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) \
             VALUES ('{lid}', '2025-06-10', '2025-06-10')"
        ),
    )
    .await;
    assert_eq!(code, "22023");

    let all = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE listing_id = '{lid}'"),
    )
    .await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].get("start_date"), Some("2025-06-01"));
    assert_eq!(all[1].get("total_price"), Some("300.00"));
}

#[tokio::test]
async fn listing_crud() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "80.5").await;
    book(&client, lid, "2025-07-01", "2025-07-03").await;

    let got = rows(&client, &format!("SELECT * FROM listings WHERE id = '{lid}'")).await;
    assert_eq!(got[0].get("name"), Some("Loft"));
    assert_eq!(got[0].get("price_per_night"), Some("80.50"));
    assert_eq!(got[0].get("bookings_count"), Some("1"));

    client
        .batch_execute(&format!(
            "UPDATE listings SET name = 'Attic', price_per_night = 95 WHERE id = '{lid}'"
        ))
        .await
        .unwrap();
    let got = rows(&client, &format!("SELECT * FROM listings WHERE id = '{lid}'")).await;
    assert_eq!(got[0].get("name"), Some("Attic"));
    assert_eq!(got[0].get("location"), Some("Lisbon"));
    assert_eq!(got[0].get("price_per_night"), Some("95.00"));

    let code = sqlstate(
        &client,
        &format!("UPDATE listings SET price_per_night = 0 WHERE id = '{lid}'"),
    )
    .await;
    assert_eq!(code, "22023");

    client
        .batch_execute(&format!("DELETE FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap();
    let got = rows(&client, &format!("SELECT * FROM listings WHERE id = '{lid}'")).await;
    assert!(got.is_empty());
    let code = sqlstate(
        &client,
        &format!("SELECT * FROM bookings WHERE listing_id = '{lid}'"),
    )
    .await;
    assert_eq!(code, "P0002");
}

#[tokio::test]
async fn status_lifecycle() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "50").await;
    let bid = book(&client, lid, "2025-08-01", "2025-08-04").await;

    client
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{bid}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'canceled' WHERE id = '{bid}'"))
        .await
        .unwrap();
    let code = sqlstate(
        &client,
        &format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{bid}'"),
    )
    .await;
    assert_eq!(code, "55000");

    // The canceled stay no longer blocks.
    book(&client, lid, "2025-08-01", "2025-08-04").await;
    let active = rows(
        &client,
        &format!(
            "SELECT * FROM bookings WHERE listing_id = '{lid}' AND status IN ('pending', 'confirmed')"
        ),
    )
    .await;
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn quote_is_a_dry_run() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "75.25").await;

    let got = rows(
        &client,
        &format!(
            "SELECT * FROM quote WHERE listing_id = '{lid}' \
             AND start_date = '2025-09-01' AND end_date = '2025-09-05'"
        ),
    )
    .await;
    assert_eq!(got[0].get("nights"), Some("4"));
    assert_eq!(got[0].get("total_price"), Some("301.00"));

    let bookings = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE listing_id = '{lid}'"),
    )
    .await;
    assert!(bookings.is_empty());
}

#[tokio::test]
async fn reviews_roundtrip() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "60").await;

    client
        .batch_execute(&format!(
            "INSERT INTO reviews (listing_id, rating, comment) VALUES ('{lid}', 5, 'Great view')"
        ))
        .await
        .unwrap();
    let code = sqlstate(
        &client,
        &format!("INSERT INTO reviews (listing_id, rating, comment) VALUES ('{lid}', 6, 'x')"),
    )
    .await;
    assert_eq!(code, "22023");

    let got = rows(&client, &format!("SELECT * FROM reviews WHERE listing_id = '{lid}'")).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].get("rating"), Some("5"));
    assert_eq!(got[0].get("comment"), Some("Great view"));
}

#[tokio::test]
async fn malformed_values_and_syntax() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "60").await;

    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings (listing_id, start_date, end_date) \
             VALUES ('{lid}', 'June 1st', '2025-06-05')"
        ),
    )
    .await;
    assert_eq!(code, "22P02");
    assert_eq!(sqlstate(&client, "SELECT * FROM guests").await, "42601");
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let lid = create_listing(&client, "100").await;
    let lid_text = lid.to_string();

    let insert = "INSERT INTO bookings (listing_id, start_date, end_date) VALUES ($1, $2, $3)";
    let n = client
        .execute(insert, &[&lid_text, &"2025-10-01", &"2025-10-03"])
        .await
        .unwrap();
    assert_eq!(n, 1);

    let err = client
        .execute(insert, &[&lid_text, &"2025-10-02", &"2025-10-04"])
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("23P01"));

    let got = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE listing_id = '{lid}'"),
    )
    .await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].get("total_price"), Some("200.00"));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let (addr, _engine) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("rentd")
        .user("rentd")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
