//! CLI command implementations.

use colored::Colorize;
use ctxsync_server::{ServerConfig, SyncServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONFIG_DIR: &str = ".ctxsync";
const CONFIG_FILE: &str = "config.json";

/// Initialize ctxsync in a directory.
pub fn init(path: &Path) -> Result<()> {
    let dir = path.join(CONFIG_DIR);
    let config_path = dir.join(CONFIG_FILE);

    if config_path.exists() {
        println!("{} Already initialized", "✓".green());
        return Ok(());
    }

    let config = ServerConfig {
        store_path: Some(dir.join("store")),
        ..Default::default()
    };
    config.save(&config_path)?;

    println!("{} Initialized ctxsync in {}", "✓".green(), path.display());
    println!("  Run {} to start the server", "ctxsync serve".cyan());

    Ok(())
}

/// Flags of `ctxsync serve` that override the config file.
pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub addr: Option<SocketAddr>,
    pub port: Option<u16>,
    pub headless: bool,
    pub store: Option<PathBuf>,
}

/// Start the sync server and run until Ctrl+C.
pub async fn serve(options: ServeOptions) -> Result<()> {
    let config = resolve_config(options)?;

    println!("{}", "Starting ctxsync server...".cyan());
    match &config.store_path {
        Some(path) => println!("{} Project store at {}", "✓".green(), path.display()),
        None => println!("{} Using in-memory project store", "⚠".yellow()),
    }

    let addr = config.addr;
    let server = SyncServer::new(config)?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    println!("{} Listening on ws://{}", "✓".green(), addr);
    if addr.ip().is_unspecified() {
        println!("  Headless mode: accepting connections from any host");
    }
    println!("  Press {} to stop", "Ctrl+C".cyan());

    server.run().await?;

    println!("{} Server stopped", "✓".green());
    Ok(())
}

fn resolve_config(options: ServeOptions) -> Result<ServerConfig> {
    let mut config = load_config(options.config.as_deref())?;

    if let Some(addr) = options.addr {
        config.addr = addr;
    }
    if let Some(port) = options.port {
        config.addr.set_port(port);
    }
    if options.headless {
        config.addr.set_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    if let Some(store) = options.store {
        config.store_path = Some(store);
    }

    config.validate()?;
    Ok(config)
}

/// Explicit path, then the project config, then the user config, then defaults.
fn load_config(explicit: Option<&Path>) -> Result<ServerConfig> {
    if let Some(path) = explicit {
        return Ok(ServerConfig::from_file(path)?);
    }

    let candidates = [
        Some(PathBuf::from(CONFIG_DIR).join(CONFIG_FILE)),
        dirs::config_dir().map(|dir| dir.join("ctxsync").join(CONFIG_FILE)),
    ];
    for path in candidates.into_iter().flatten() {
        if path.exists() {
            debug!("Loading config from {}", path.display());
            return Ok(ServerConfig::from_file(&path)?);
        }
    }

    Ok(ServerConfig::default())
}

/// Follow a project's updates until Ctrl+C or the server closes.
pub async fn watch(project: &str, base: &str, user: Option<&str>, since: u64) -> Result<()> {
    let url = endpoint_url(base, &["ws", "context", project], user, Some(since))?;
    println!("{} Connecting to {}", "→".cyan(), url);

    let (mut socket, _) = connect_async(url.as_str()).await?;
    println!("{} Watching {} (Ctrl+C to stop)\n", "✓".green(), project.cyan());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                socket.close(None).await?;
                break;
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text)?;
                    print_frame(&value);

                    // Answer server heartbeats so the idle timeout never fires.
                    if value["type"] == "heartbeat" {
                        let reply = json!({ "type": "heartbeat" }).to_string();
                        socket.send(Message::Text(reply)).await?;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.into_owned()).unwrap_or_default();
                    println!("{} Server closed the connection {}", "⚠".yellow(), reason.dimmed());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    Ok(())
}

/// Print statistics of a running server.
pub async fn stats(base: &str) -> Result<()> {
    let url = endpoint_url(base, &["ws", "updates"], None, None)?;
    let (mut socket, _) = connect_async(url.as_str()).await?;

    let request = json!({ "type": "get_stats" }).to_string();
    socket.send(Message::Text(request)).await?;

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        next_of_type(&mut socket, "connection_stats"),
    )
    .await
    .map_err(|_| "timed out waiting for stats")??;
    socket.close(None).await?;

    let connections = &reply["connections"];
    println!("{}", "Connections".bold());
    println!("  Total:    {}", connections["total_connections"]);
    println!("  Global:   {}", connections["global_connections"]);

    if let Some(projects) = connections["project_connections"].as_object() {
        for (name, project) in projects {
            let users: Vec<_> = project["users"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect();
            println!(
                "  {} {} connection(s) {}",
                name.cyan(),
                project["connection_count"],
                users.join(", ").dimmed()
            );
        }
    }

    let dispatcher = &reply["dispatcher"];
    println!("\n{}", "Dispatcher".bold());
    println!("  Running:   {}", dispatcher["running"]);
    println!(
        "  Queued:    {}/{}",
        dispatcher["queued"], dispatcher["capacity"]
    );
    println!("  Processed: {}", dispatcher["processed"]);
    println!("  Failed:    {}", dispatcher["failed"]);
    println!("  Rejected:  {}", dispatcher["rejected"]);

    Ok(())
}

async fn next_of_type(socket: &mut Socket, kind: &str) -> Result<Value> {
    while let Some(frame) = socket.next().await {
        if let Message::Text(text) = frame? {
            let value: Value = serde_json::from_str(&text)?;
            if value["type"] == kind {
                return Ok(value);
            }
        }
    }
    Err(format!("connection closed before {} arrived", kind).into())
}

/// Builds an endpoint URL below `base`, percent-encoding each segment.
fn endpoint_url(
    base: &str,
    segments: &[&str],
    user: Option<&str>,
    since: Option<u64>,
) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| format!("{} cannot be used as a server URL", base))?
        .pop_if_empty()
        .extend(segments);

    let mut query = Vec::new();
    if let Some(user) = user {
        query.push(("user_id", user.to_string()));
    }
    if let Some(since) = since {
        query.push(("since", since.to_string()));
    }
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(url)
}

fn print_frame(value: &Value) {
    let kind = value["type"].as_str().unwrap_or("unknown");
    let label = match kind {
        "error" => kind.red().bold(),
        "user_joined" | "user_left" => kind.yellow(),
        "heartbeat" | "heartbeat_response" | "pong" => kind.dimmed(),
        "initial_state" | "missed_changes" | "changes" => kind.green(),
        _ => kind.cyan(),
    };
    let timestamp = value["timestamp"].as_str().unwrap_or_default();
    let user = value["user_id"]
        .as_str()
        .map(|u| format!(" by {}", u))
        .unwrap_or_default();

    println!("{} {}{}", timestamp.dimmed(), label, user);

    match kind {
        "missed_changes" | "changes" => {
            for change in value["changes"].as_array().into_iter().flatten() {
                println!(
                    "    #{} {} {}",
                    change["id"],
                    change["type"].as_str().unwrap_or_default(),
                    change["data"]
                );
            }
        }
        "initial_state" => {
            if let Ok(pretty) = serde_json::to_string_pretty(&value["data"]) {
                for line in pretty.lines() {
                    println!("    {}", line);
                }
            }
        }
        "heartbeat" | "heartbeat_response" | "pong" => {}
        _ if !value["data"].is_null() => println!("    {}", value["data"]),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_project_url() {
        let url = endpoint_url(
            "ws://127.0.0.1:8765",
            &["ws", "context", "my project"],
            Some("alice"),
            Some(3),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8765/ws/context/my%20project?user_id=alice&since=3"
        );
    }

    #[test]
    fn test_global_url_has_no_query() {
        let url = endpoint_url("ws://localhost:9000/", &["ws", "updates"], None, None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/ws/updates");
    }

    #[test]
    fn test_init_writes_config_once() {
        let dir = tempdir().unwrap();
        init(dir.path()).unwrap();

        let path = dir.path().join(CONFIG_DIR).join(CONFIG_FILE);
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(
            config.store_path,
            Some(dir.path().join(CONFIG_DIR).join("store"))
        );

        // Second run leaves the file alone.
        init(dir.path()).unwrap();
        assert_eq!(ServerConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        ServerConfig::default().save(&path).unwrap();

        let config = resolve_config(ServeOptions {
            config: Some(path),
            addr: None,
            port: Some(9100),
            headless: true,
            store: Some(PathBuf::from("/var/lib/ctxsync")),
        })
        .unwrap();

        assert_eq!(config.addr, "0.0.0.0:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.store_path, Some(PathBuf::from("/var/lib/ctxsync")));
    }
}
