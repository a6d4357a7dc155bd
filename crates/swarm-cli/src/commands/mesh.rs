use serde_json::Value;
use swarm_config::SwarmConfig;
use swarm_core::{SwarmError, node_name};

/// Thin client for a running node's HTTP API.
struct NodeApi {
    client: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

impl NodeApi {
    fn new(config: &SwarmConfig) -> Self {
        let client = reqwest::Client::builder()
            .tcp_keepalive(None)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base: base_url(&config.server.listen),
            api_key: config.server.api_key.clone(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> swarm_core::Result<reqwest::Response> {
        self.authorize(req).send().await.map_err(|e| {
            SwarmError::Api(format!(
                "cannot reach node at {}, is it running? ({e})",
                self.base
            ))
        })
    }

    async fn json(resp: reqwest::Response) -> swarm_core::Result<Value> {
        if !resp.status().is_success() {
            return Err(SwarmError::Api(format!("server returned {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| SwarmError::Api(e.to_string()))
    }

    async fn get(&self, path: &str) -> swarm_core::Result<Value> {
        let resp = self
            .send(self.client.get(format!("{}{path}", self.base)))
            .await?;
        Self::json(resp).await
    }
}

/// `0.0.0.0` is a bind address; talk to loopback instead.
fn base_url(listen: &str) -> String {
    let host = match listen.strip_prefix("0.0.0.0:") {
        Some(port) => format!("127.0.0.1:{port}"),
        None => listen.to_string(),
    };
    format!("http://{host}")
}

pub(super) async fn cmd_status(config: &SwarmConfig) -> swarm_core::Result<()> {
    let api = NodeApi::new(config);
    let data = api.get("/api/status").await?;

    println!("Node Status\n");
    println!(
        "   Name:         {} ({})",
        data["name"].as_str().unwrap_or("?"),
        data["id_hex"].as_str().unwrap_or("?")
    );
    println!("   Role:         {}", data["role"].as_str().unwrap_or("?"));
    println!(
        "   Coordinator:  {}",
        data["coordinator_id"]
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .map(node_name)
            .unwrap_or_else(|| "?".into())
    );
    println!("   Peers:        {}", data["peer_count"].as_u64().unwrap_or(0));
    println!("   States:       {}", data["state_count"].as_u64().unwrap_or(0));
    println!("   Uptime:       {}s", data["uptime_secs"].as_u64().unwrap_or(0));
    println!(
        "   Telemetry:    {}{}",
        if data["telemetry_enabled"].as_bool().unwrap_or(false) {
            "on"
        } else {
            "off"
        },
        if data["gateway"].as_bool().unwrap_or(false) {
            " (gateway)"
        } else {
            ""
        }
    );
    println!(
        "   Bad messages: {}",
        data["stats"]["decode_errors"].as_u64().unwrap_or(0)
    );
    Ok(())
}

pub(super) async fn cmd_peers(config: &SwarmConfig) -> swarm_core::Result<()> {
    let api = NodeApi::new(config);
    let data = api.get("/api/nodes").await?;

    let count = data["count"].as_u64().unwrap_or(0);
    if count == 0 {
        println!("No peers known.");
        return Ok(());
    }

    println!("Peers ({count})\n");
    for peer in data["nodes"].as_array().into_iter().flatten() {
        let status = if peer["alive"].as_bool().unwrap_or(false) {
            "OK"
        } else {
            "DEAD"
        };
        println!(
            "   {:<12} [{:<5}] {:<4}  seen {}ms ago",
            peer["name"].as_str().unwrap_or("?"),
            peer["role"].as_str().unwrap_or("?"),
            status,
            peer["last_seen_ms"].as_u64().unwrap_or(0)
        );
    }
    Ok(())
}

pub(super) async fn cmd_state(config: &SwarmConfig) -> swarm_core::Result<()> {
    let api = NodeApi::new(config);
    let data = api.get("/api/state").await?;

    let entries = data["state"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("Shared state is empty.");
        return Ok(());
    }

    println!("Shared State ({})\n", entries.len());
    for e in &entries {
        let origin = e["origin"]
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .map(node_name)
            .unwrap_or_else(|| "?".into());
        println!(
            "   {} = {} (v{} from {})",
            e["key"].as_str().unwrap_or("?"),
            e["value"].as_str().unwrap_or(""),
            e["version"].as_u64().unwrap_or(0),
            origin
        );
    }
    Ok(())
}

pub(super) async fn cmd_set(
    config: &SwarmConfig,
    key: String,
    value: String,
) -> swarm_core::Result<()> {
    let api = NodeApi::new(config);
    let body = serde_json::json!({ "key": key, "value": value });
    let resp = api
        .send(api.client.post(format!("{}/api/state", api.base)).json(&body))
        .await?;
    let data = NodeApi::json(resp).await?;

    if data["changed"].as_bool().unwrap_or(false) {
        println!("{key} = {value}");
    } else {
        println!("{key} already {value}, nothing changed");
    }
    Ok(())
}

pub(super) async fn cmd_get(config: &SwarmConfig, key: String) -> swarm_core::Result<()> {
    let api = NodeApi::new(config);
    let resp = api
        .send(api.client.get(format!("{}/api/state/{key}", api.base)))
        .await?;

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        println!("{key} is not set");
        return Ok(());
    }
    let data = NodeApi::json(resp).await?;
    println!("{}", data["value"].as_str().unwrap_or(""));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_rewrites_wildcard_bind() {
        assert_eq!(base_url("0.0.0.0:8080"), "http://127.0.0.1:8080");
        assert_eq!(base_url("10.0.0.2:9000"), "http://10.0.0.2:9000");
    }
}
