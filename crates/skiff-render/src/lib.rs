//! Forwarder-config renderer.
//!
//! Projects one node's slice of the relational model (assigned users, their
//! enabled proxies, the node row itself) into the canonical forwarder
//! configuration document. Output is deterministic: sorted object keys
//! (serde_json's default map is a BTreeMap), LF line endings, no trailing
//! whitespace — so the hex SHA-256 fingerprint doubles as the config
//! version. A per-node cache keyed on the store's render generation makes
//! repeated reads byte-identical and cheap.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

use skiff_proto::{Protocol, Security, TransportNetwork, client_tag, inbound_tag};
use skiff_store::{ProxyRecord, Store, StoreError, UserRecord};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("node '{0}' not found")]
    NodeMissing(String),

    #[error("port {port} bound by both proxy '{first}' and proxy '{second}'")]
    ConflictingPorts {
        port: u16,
        first: String,
        second: String,
    },

    #[error("proxy '{proxy_id}': {reason}")]
    UnsupportedProtocol { proxy_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RenderError>;

// ─── Output ───────────────────────────────────────────────────────────────────

/// One rendered forwarder config. `fingerprint` is the hex SHA-256 of
/// `config`; equal fingerprints imply byte-equal configs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub fingerprint: String,
    pub config: String,
    pub rendered_at: DateTime<Utc>,
}

// ─── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Render node-unpinned proxies (`node_id = NULL`) on every node their
    /// owner is assigned to.
    pub bind_unpinned_proxies: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            bind_unpinned_proxies: true,
        }
    }
}

// ─── Renderer ─────────────────────────────────────────────────────────────────

struct CacheEntry {
    generation: u64,
    rendered: Rendered,
}

/// Renderer with a read-mostly per-node cache.
pub struct ConfigRenderer {
    store: Store,
    options: RenderOptions,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl ConfigRenderer {
    pub fn new(store: Store, options: RenderOptions) -> Self {
        Self {
            store,
            options,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Render a node's config, serving from cache while the store's render
    /// generation is unchanged.
    pub async fn render(&self, node_id: &str) -> Result<Rendered> {
        let generation = self.store.render_generation(node_id);
        if let Some(entry) = self.cache.read().get(node_id)
            && entry.generation == generation
        {
            debug!(node = %node_id, generation, "render cache hit");
            return Ok(entry.rendered.clone());
        }

        let rendered = self.render_uncached(node_id).await?;
        self.cache.write().insert(
            node_id.to_string(),
            CacheEntry {
                generation,
                rendered: rendered.clone(),
            },
        );
        Ok(rendered)
    }

    /// Render bypassing the cache. One consistent set of reads.
    pub async fn render_uncached(&self, node_id: &str) -> Result<Rendered> {
        let Some(node) = self.store.get_node(node_id).await? else {
            return Err(RenderError::NodeMissing(node_id.to_string()));
        };

        let now = Utc::now();
        let users = self.store.users_for_node(node_id).await?;
        let renderable: HashMap<&str, &UserRecord> = users
            .iter()
            .filter(|u| u.is_renderable(now))
            .map(|u| (u.id.as_str(), u))
            .collect();

        let mut proxies: Vec<ProxyRecord> = self
            .store
            .proxies_for_node(node_id, self.options.bind_unpinned_proxies)
            .await?
            .into_iter()
            .filter(|p| renderable.contains_key(p.user_id.as_str()))
            .collect();
        proxies.sort_by(|a, b| a.id.cmp(&b.id));

        check_port_conflicts(&proxies)?;

        let mut inbounds = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            inbounds.push(render_inbound(proxy)?);
        }

        let mut doc = json!({
            "log": { "loglevel": "warning" },
            "inbounds": inbounds,
            "outbounds": [
                { "protocol": "freedom", "settings": {}, "tag": "direct" },
                { "protocol": "blackhole", "settings": {}, "tag": "block" },
            ],
            "routing": {
                "domainStrategy": "AsIs",
                "rules": [
                    { "type": "field", "protocol": ["bittorrent"], "outboundTag": "block" },
                ],
            },
        });

        if node.metrics_enabled {
            let map = doc.as_object_mut().expect("document is an object");
            map.insert("stats".to_string(), json!({}));
            map.insert(
                "api".to_string(),
                json!({ "tag": "api", "services": ["StatsService"] }),
            );
            map.insert(
                "policy".to_string(),
                json!({
                    "levels": { "0": { "statsUserUplink": true, "statsUserDownlink": true } },
                    "system": { "statsInboundUplink": true, "statsInboundDownlink": true },
                }),
            );
        }

        let config = canonical_json(&doc);
        let fingerprint = hex::encode(Sha256::digest(config.as_bytes()));
        info!(node = %node_id, inbounds = proxies.len(), fingerprint = %fingerprint, "config rendered");

        Ok(Rendered {
            fingerprint,
            config,
            rendered_at: now,
        })
    }
}

/// Canonical serialization: sorted keys (BTreeMap-backed map), pretty
/// printed with LF, no trailing whitespace.
fn canonical_json(doc: &Value) -> String {
    serde_json::to_string_pretty(doc).expect("config document serializes")
}

fn check_port_conflicts(proxies: &[ProxyRecord]) -> Result<()> {
    let mut seen: HashMap<u16, &str> = HashMap::new();
    for proxy in proxies {
        if let Some(first) = seen.insert(proxy.listen_port, &proxy.id) {
            return Err(RenderError::ConflictingPorts {
                port: proxy.listen_port,
                first: first.to_string(),
                second: proxy.id.clone(),
            });
        }
    }
    Ok(())
}

// ─── Inbound rendering ────────────────────────────────────────────────────────

fn render_inbound(proxy: &ProxyRecord) -> Result<Value> {
    let tag = inbound_tag(&proxy.id);
    let email = client_tag(&proxy.user_id, &proxy.id);
    let s = &proxy.settings;

    let settings = match proxy.protocol {
        Protocol::Vless => json!({
            "clients": [ { "id": s.credential, "level": 0, "email": email } ],
            "decryption": "none",
        }),
        Protocol::Vmess => json!({
            "clients": [ { "id": s.credential, "level": 0, "alterId": s.alter_id, "email": email } ],
        }),
        Protocol::Trojan => json!({
            "clients": [ { "password": s.credential, "level": 0, "email": email } ],
        }),
        Protocol::Shadowsocks => {
            if s.network != TransportNetwork::Tcp {
                return Err(RenderError::UnsupportedProtocol {
                    proxy_id: proxy.id.clone(),
                    reason: format!("shadowsocks does not support '{}' transport", s.network),
                });
            }
            json!({
                "method": s.method.clone().unwrap_or_else(|| "aes-128-gcm".to_string()),
                "password": s.credential,
                "network": "tcp,udp",
            })
        }
    };

    let mut inbound = json!({
        "tag": tag,
        "listen": "0.0.0.0",
        "port": proxy.listen_port,
        "protocol": proxy.protocol.to_string(),
        "settings": settings,
        "streamSettings": stream_settings(proxy),
        "sniffing": { "enabled": true, "destOverride": ["http", "tls"] },
    });

    // Shadowsocks carries its network at the settings level, not stream.
    if proxy.protocol == Protocol::Shadowsocks && s.security == Security::None {
        inbound
            .as_object_mut()
            .expect("inbound is an object")
            .remove("streamSettings");
    }

    Ok(inbound)
}

fn stream_settings(proxy: &ProxyRecord) -> Value {
    let s = &proxy.settings;
    let mut stream = serde_json::Map::new();
    stream.insert("network".to_string(), json!(s.network.to_string()));

    match s.network {
        TransportNetwork::Tcp => {
            stream.insert("tcpSettings".to_string(), json!({}));
        }
        TransportNetwork::Ws => {
            let mut ws = serde_json::Map::new();
            ws.insert(
                "path".to_string(),
                json!(s.ws_path.clone().unwrap_or_else(|| "/".to_string())),
            );
            if let Some(host) = &s.ws_host {
                ws.insert("headers".to_string(), json!({ "Host": host }));
            }
            stream.insert("wsSettings".to_string(), Value::Object(ws));
        }
        TransportNetwork::Http => {
            stream.insert(
                "httpSettings".to_string(),
                json!({
                    "host": s.http_hosts,
                    "path": s.http_path.clone().unwrap_or_else(|| "/".to_string()),
                }),
            );
        }
        TransportNetwork::Grpc => {
            stream.insert(
                "grpcSettings".to_string(),
                json!({
                    "serviceName": s.grpc_service_name.clone().unwrap_or_default(),
                }),
            );
        }
        TransportNetwork::Quic => {
            stream.insert(
                "quicSettings".to_string(),
                json!({
                    "security": s.quic_security.clone().unwrap_or_else(|| "none".to_string()),
                    "key": s.quic_key.clone().unwrap_or_default(),
                }),
            );
        }
    }

    stream.insert("security".to_string(), json!(s.security.to_string()));
    if s.security == Security::Tls {
        let mut tls = serde_json::Map::new();
        if let Some(sni) = &s.sni {
            tls.insert("serverName".to_string(), json!(sni));
        }
        tls.insert(
            "certificates".to_string(),
            json!([{
                "certificateFile": s.cert_path.clone().unwrap_or_default(),
                "keyFile": s.key_path.clone().unwrap_or_default(),
            }]),
        );
        if !s.alpn.is_empty() {
            tls.insert("alpn".to_string(), json!(s.alpn));
        }
        stream.insert("tlsSettings".to_string(), Value::Object(tls));
    }

    Value::Object(stream)
}
