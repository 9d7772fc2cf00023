//! A bandwidth-limited echo server.
//!
//! Usage: `throttled_echo [ADDR [GLOBAL_BPS [CONN_BPS]]]`
//!
//! Connect a few clients (`nc 127.0.0.1 4040`) and watch them share the
//! global budget.

use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4040".into());
    let global: u64 = args
        .next()
        .map(|a| a.parse())
        .transpose()?
        .unwrap_or(64 * 1024);
    let per_conn: u64 = args
        .next()
        .map(|a| a.parse())
        .transpose()?
        .unwrap_or(16 * 1024);

    let listener = flowcap::listen(addr.as_str(), global, per_conn).await?;
    println!(
        "echoing on {} ({global} B/s shared, {per_conn} B/s per connection)",
        listener.local_addr()?
    );

    loop {
        let (mut conn, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0_u8; 4096];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = conn.close().await;
            println!("{peer} disconnected");
        });
    }
}
