//! Embedded relational store.
//!
//! Reservations, tokens, tunnel records, custom domains, request logs and
//! minute-bucketed metric rollups live in a single SQLite file. The live
//! registry stays authoritative for routing; everything here is durable
//! state that survives agent reconnects and server restarts, written with
//! idempotent-upsert semantics.
//!
//! Schema changes ship as `*.sql` files in a migrations directory, applied
//! in lexicographic order and recorded in `schema_migrations`.

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("token required")]
    TokenRequired,
    #[error("relay token not configured")]
    TokenMissing,
    #[error("{0} required")]
    FieldRequired(&'static str),
    #[error("apply migration {file}: {source}")]
    Migration {
        file: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Durable record of a tunnel, keyed by the agent-chosen UUID.
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub local_host: String,
    pub local_port: u16,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Persistent subdomain reservation plus its allowlist.
#[derive(Debug, Clone, Default)]
pub struct HttpReservation {
    pub tunnel_id: String,
    pub subdomain: String,
    pub allowlist: Vec<String>,
}

/// Persistent (protocol, external port) reservation.
#[derive(Debug, Clone)]
pub struct PortReservation {
    pub protocol: String,
    pub external_port: u16,
    pub tunnel_id: String,
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
}

/// Custom domain mapping used as a secondary HTTP route.
#[derive(Debug, Clone, Default)]
pub struct CustomDomain {
    pub domain: String,
    pub tunnel_id: String,
    pub status: String,
    pub cert_state: String,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for PortReservation {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            external_port: 0,
            tunnel_id: String::new(),
            reserved: false,
            created_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// One proxied request or connection, persisted for observability.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub tunnel_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub remote_addr: String,
    pub summary: String,
    pub status: Option<u16>,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Per-minute counters; inserts with the same key accumulate.
#[derive(Debug, Clone, Copy)]
pub struct MetricRollup {
    pub minute_bucket: i64,
    pub req_count: i64,
    pub conn_count: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// A `MetricRollup` together with its tunnel id.
#[derive(Debug, Clone)]
pub struct TunnelMetricRollup {
    pub tunnel_id: String,
    pub rollup: MetricRollup,
}

/// Handle to the SQLite store. Cheap methods behind a single connection
/// mutex; callers treat relay-path writes as best-effort.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Generate a fresh bearer token: 32 random bytes, hex encoded.
#[must_use]
pub fn generate_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply every unapplied `*.sql` file in `dir`, lexicographically, each
    /// in its own transaction recorded in `schema_migrations`.
    pub fn apply_migrations(&self, dir: &Path) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let mut files: Vec<String> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".sql") {
                files.push(name);
            }
        }
        files.sort();

        for file in files {
            let applied: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                params![file],
                |row| row.get(0),
            )?;
            if applied > 0 {
                continue;
            }
            let contents = fs::read_to_string(dir.join(&file))?;
            let tx = conn.transaction()?;
            tx.execute_batch(&contents)
                .map_err(|source| StoreError::Migration {
                    file: file.clone(),
                    source,
                })?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![file, now_utc()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    // ─── Tokens ──────────────────────────────────────────────────────────

    /// Make sure at least one unrevoked token exists. A no-op when one
    /// does; otherwise inserts `raw`, failing if `raw` is blank.
    pub fn ensure_token(&self, raw: &str) -> Result<(), StoreError> {
        if self.has_active_token()? {
            return Ok(());
        }
        if raw.trim().is_empty() {
            return Err(StoreError::TokenMissing);
        }
        self.insert_token(raw)
    }

    pub fn has_active_token(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tokens WHERE revoked_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether `raw` matches an unrevoked token (compared by SHA-256 hex).
    pub fn validate_token(&self, raw: &str) -> Result<bool, StoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tokens WHERE token_hash = ?1 AND revoked_at IS NULL",
            params![hash_token(trimmed)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn insert_token(&self, raw: &str) -> Result<(), StoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::TokenRequired);
        }
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO tokens (token_hash, created_at) VALUES (?1, ?2)",
            params![hash_token(trimmed), now_utc()],
        )?;
        Ok(())
    }

    /// Revoke every active token and insert `raw`, atomically.
    pub fn rotate_token(&self, raw: &str) -> Result<(), StoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::TokenRequired);
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tokens SET revoked_at = ?1 WHERE revoked_at IS NULL",
            params![now_utc()],
        )?;
        tx.execute(
            "INSERT INTO tokens (token_hash, created_at) VALUES (?1, ?2)",
            params![hash_token(trimmed), now_utc()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ─── Reservations ────────────────────────────────────────────────────

    /// Upsert a subdomain reservation, replacing the tunnel's allowlist
    /// atomically.
    pub fn upsert_http_reservation(&self, res: &HttpReservation) -> Result<(), StoreError> {
        if res.subdomain.trim().is_empty() {
            return Err(StoreError::FieldRequired("subdomain"));
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO subdomains (subdomain, tunnel_id, reserved, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(subdomain) DO UPDATE SET tunnel_id = excluded.tunnel_id",
            params![res.subdomain, res.tunnel_id, now_utc()],
        )?;
        if !res.tunnel_id.is_empty() {
            tx.execute(
                "DELETE FROM ip_allowlists WHERE tunnel_id = ?1",
                params![res.tunnel_id],
            )?;
            for cidr in &res.allowlist {
                tx.execute(
                    "INSERT INTO ip_allowlists (tunnel_id, cidr, created_at) VALUES (?1, ?2, ?3)",
                    params![res.tunnel_id, cidr, now_utc()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_http_reservations(&self) -> Result<Vec<HttpReservation>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT s.subdomain, s.tunnel_id, IFNULL(GROUP_CONCAT(a.cidr), '')
             FROM subdomains s
             LEFT JOIN ip_allowlists a ON a.tunnel_id = s.tunnel_id
             GROUP BY s.subdomain, s.tunnel_id
             ORDER BY s.subdomain ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let subdomain: String = row.get(0)?;
            let tunnel_id: String = row.get(1)?;
            let joined: String = row.get(2)?;
            Ok((subdomain, tunnel_id, joined))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (subdomain, tunnel_id, joined) = row?;
            let allowlist = if joined.is_empty() {
                Vec::new()
            } else {
                joined.split(',').map(ToString::to_string).collect()
            };
            results.push(HttpReservation {
                tunnel_id,
                subdomain,
                allowlist,
            });
        }
        Ok(results)
    }

    pub fn upsert_port_reservation(&self, res: &PortReservation) -> Result<(), StoreError> {
        if res.protocol.trim().is_empty() {
            return Err(StoreError::FieldRequired("protocol"));
        }
        if res.external_port == 0 {
            return Err(StoreError::FieldRequired("external port"));
        }
        let created_at = if res.created_at == DateTime::UNIX_EPOCH {
            now_utc()
        } else {
            format_ts(res.created_at)
        };
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO port_reservations (protocol, external_port, tunnel_id, reserved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(protocol, external_port) DO UPDATE SET
                 tunnel_id = excluded.tunnel_id,
                 reserved = excluded.reserved",
            params![
                res.protocol,
                res.external_port,
                res.tunnel_id,
                i64::from(res.reserved),
                created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_port_reservation(
        &self,
        protocol: &str,
        external_port: u16,
    ) -> Result<Option<PortReservation>, StoreError> {
        if protocol.trim().is_empty() || external_port == 0 {
            return Ok(None);
        }
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT protocol, external_port, tunnel_id, reserved, created_at
                 FROM port_reservations WHERE protocol = ?1 AND external_port = ?2",
                params![protocol, external_port],
                |row| {
                    Ok(PortReservation {
                        protocol: row.get(0)?,
                        external_port: row.get(1)?,
                        tunnel_id: row.get(2)?,
                        reserved: row.get::<_, i64>(3)? != 0,
                        created_at: parse_ts(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_port_reservations(
        &self,
        protocol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PortReservation>, StoreError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().expect("store lock poisoned");
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(PortReservation {
                protocol: row.get(0)?,
                external_port: row.get(1)?,
                tunnel_id: row.get(2)?,
                reserved: row.get::<_, i64>(3)? != 0,
                created_at: parse_ts(&row.get::<_, String>(4)?),
            })
        };
        let mut results = Vec::new();
        if let Some(protocol) = protocol {
            let mut stmt = conn.prepare(
                "SELECT protocol, external_port, tunnel_id, reserved, created_at
                 FROM port_reservations WHERE protocol = ?1
                 ORDER BY external_port ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![protocol, limit as i64], map_row)?;
            for row in rows {
                results.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT protocol, external_port, tunnel_id, reserved, created_at
                 FROM port_reservations ORDER BY external_port ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_row)?;
            for row in rows {
                results.push(row?);
            }
        }
        Ok(results)
    }

    // ─── Tunnels ─────────────────────────────────────────────────────────

    pub fn upsert_tunnel(&self, tunnel: &TunnelRecord) -> Result<(), StoreError> {
        if tunnel.id.is_empty() {
            return Err(StoreError::FieldRequired("tunnel id"));
        }
        if tunnel.protocol.is_empty() {
            return Err(StoreError::FieldRequired("protocol"));
        }
        let status = if tunnel.status.is_empty() {
            "active"
        } else {
            &tunnel.status
        };
        let created_at = if tunnel.created_at == DateTime::UNIX_EPOCH {
            now_utc()
        } else {
            format_ts(tunnel.created_at)
        };
        let last_seen = if tunnel.last_seen == DateTime::UNIX_EPOCH {
            now_utc()
        } else {
            format_ts(tunnel.last_seen)
        };
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO tunnels (id, name, protocol, local_host, local_port, status, created_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 protocol = excluded.protocol,
                 local_host = excluded.local_host,
                 local_port = excluded.local_port,
                 status = excluded.status,
                 last_seen = excluded.last_seen",
            params![
                tunnel.id,
                tunnel.name,
                tunnel.protocol,
                tunnel.local_host,
                tunnel.local_port,
                status,
                created_at,
                last_seen
            ],
        )?;
        Ok(())
    }

    pub fn mark_tunnel_status(&self, tunnel_id: &str, status: &str) -> Result<(), StoreError> {
        if tunnel_id.is_empty() {
            return Err(StoreError::FieldRequired("tunnel id"));
        }
        let status = if status.is_empty() { "inactive" } else { status };
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE tunnels SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status, now_utc(), tunnel_id],
        )?;
        Ok(())
    }

    /// Heartbeat bookkeeping: bump last-seen without touching status.
    pub fn touch_tunnel(&self, tunnel_id: &str) -> Result<(), StoreError> {
        if tunnel_id.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE tunnels SET last_seen = ?1 WHERE id = ?2",
            params![now_utc(), tunnel_id],
        )?;
        Ok(())
    }

    pub fn list_tunnels(&self, limit: usize) -> Result<Vec<TunnelRecord>, StoreError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, protocol, local_host, local_port, status, created_at, last_seen
             FROM tunnels ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(TunnelRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                protocol: row.get(2)?,
                local_host: row.get(3)?,
                local_port: row.get(4)?,
                status: row.get(5)?,
                created_at: parse_ts(&row.get::<_, String>(6)?),
                last_seen: parse_ts(&row.get::<_, String>(7)?),
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ─── Custom domains ──────────────────────────────────────────────────

    pub fn upsert_custom_domain(&self, domain: &CustomDomain) -> Result<(), StoreError> {
        let clean = domain.domain.trim().to_lowercase();
        if clean.is_empty() {
            return Err(StoreError::FieldRequired("domain"));
        }
        let status = if domain.status.is_empty() {
            "pending"
        } else {
            &domain.status
        };
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO custom_domains (domain, tunnel_id, status, cert_state, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(domain) DO UPDATE SET
                 tunnel_id = excluded.tunnel_id,
                 status = excluded.status,
                 cert_state = excluded.cert_state,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            params![
                clean,
                domain.tunnel_id,
                status,
                domain.cert_state,
                domain.last_error,
                now_utc(),
                now_utc()
            ],
        )?;
        Ok(())
    }

    pub fn get_custom_domain(&self, domain: &str) -> Result<Option<CustomDomain>, StoreError> {
        let clean = domain.trim().to_lowercase();
        if clean.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT domain, tunnel_id, status, cert_state, last_error, created_at, updated_at
                 FROM custom_domains WHERE domain = ?1",
                params![clean],
                |row| {
                    Ok(CustomDomain {
                        domain: row.get(0)?,
                        tunnel_id: row.get(1)?,
                        status: row.get(2)?,
                        cert_state: row.get(3)?,
                        last_error: row.get(4)?,
                        created_at: parse_ts(&row.get::<_, String>(5)?),
                        updated_at: parse_ts(&row.get::<_, String>(6)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_custom_domains(&self, limit: usize) -> Result<Vec<CustomDomain>, StoreError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT domain, tunnel_id, status, cert_state, last_error, created_at, updated_at
             FROM custom_domains ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(CustomDomain {
                domain: row.get(0)?,
                tunnel_id: row.get(1)?,
                status: row.get(2)?,
                cert_state: row.get(3)?,
                last_error: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?),
                updated_at: parse_ts(&row.get::<_, String>(6)?),
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ─── Logs & metrics ──────────────────────────────────────────────────

    pub fn insert_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let kind = if entry.kind.is_empty() {
            "http"
        } else {
            &entry.kind
        };
        let ts = if entry.timestamp == DateTime::UNIX_EPOCH {
            now_utc()
        } else {
            format_ts(entry.timestamp)
        };
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO logs (tunnel_id, ts, kind, remote_addr, summary, status_code, bytes_in, bytes_out)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.tunnel_id,
                ts,
                kind,
                entry.remote_addr,
                entry.summary,
                entry.status,
                entry.bytes_in,
                entry.bytes_out
            ],
        )?;
        Ok(())
    }

    pub fn list_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT tunnel_id, ts, kind, remote_addr, summary, status_code, bytes_in, bytes_out
             FROM logs ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LogEntry {
                tunnel_id: row.get(0)?,
                timestamp: parse_ts(&row.get::<_, String>(1)?),
                kind: row.get(2)?,
                remote_addr: row.get(3)?,
                summary: row.get(4)?,
                status: row.get(5)?,
                bytes_in: row.get(6)?,
                bytes_out: row.get(7)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Accumulate counters into the tunnel's minute bucket.
    pub fn add_metric(
        &self,
        tunnel_id: &str,
        ts: DateTime<Utc>,
        req_count: i64,
        conn_count: i64,
        bytes_in: i64,
        bytes_out: i64,
    ) -> Result<(), StoreError> {
        if tunnel_id.is_empty() {
            return Ok(());
        }
        let minute_bucket = ts.timestamp() / 60;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO metrics_rollup (tunnel_id, minute_bucket, req_count, conn_count, bytes_in, bytes_out)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tunnel_id, minute_bucket) DO UPDATE SET
                 req_count = req_count + excluded.req_count,
                 conn_count = conn_count + excluded.conn_count,
                 bytes_in = bytes_in + excluded.bytes_in,
                 bytes_out = bytes_out + excluded.bytes_out",
            params![
                tunnel_id,
                minute_bucket,
                req_count,
                conn_count,
                bytes_in,
                bytes_out
            ],
        )?;
        Ok(())
    }

    pub fn list_metrics(&self, limit: usize) -> Result<Vec<TunnelMetricRollup>, StoreError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT tunnel_id, minute_bucket, req_count, conn_count, bytes_in, bytes_out
             FROM metrics_rollup ORDER BY minute_bucket DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(TunnelMetricRollup {
                tunnel_id: row.get(0)?,
                rollup: MetricRollup {
                    minute_bucket: row.get(1)?,
                    req_count: row.get(2)?,
                    conn_count: row.get(3)?,
                    bytes_in: row.get(4)?,
                    bytes_out: row.get(5)?,
                },
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("relay.db")).unwrap();
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        store.apply_migrations(&migrations).unwrap();
        (store, dir)
    }

    #[test]
    fn test_migrations_idempotent() {
        let (store, _dir) = open_store();
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        store.apply_migrations(&migrations).unwrap();

        let conn = store.conn.lock().unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(1) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        let expected = std::fs::read_dir(&migrations)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".sql")
            })
            .count() as i64;
        assert_eq!(applied, expected);
    }

    #[test]
    fn test_generate_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_token_rotation_atomic() {
        let (store, _dir) = open_store();
        store.insert_token("first").unwrap();
        store.insert_token("second").unwrap();
        assert!(store.validate_token("first").unwrap());

        store.rotate_token("third").unwrap();
        assert!(!store.validate_token("first").unwrap());
        assert!(!store.validate_token("second").unwrap());
        assert!(store.validate_token("third").unwrap());

        let conn = store.conn.lock().unwrap();
        let active: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM tokens WHERE revoked_at IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_ensure_token_idempotent() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.ensure_token(""),
            Err(StoreError::TokenMissing)
        ));
        store.ensure_token("bootstrap").unwrap();
        assert!(store.validate_token("bootstrap").unwrap());

        // With an active token present, ensure_token never inserts.
        store.ensure_token("something-else").unwrap();
        assert!(!store.validate_token("something-else").unwrap());
        let conn = store.conn.lock().unwrap();
        let active: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM tokens WHERE revoked_at IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_validate_token_rejects_blank_and_unknown() {
        let (store, _dir) = open_store();
        store.insert_token("real").unwrap();
        assert!(!store.validate_token("").unwrap());
        assert!(!store.validate_token("  ").unwrap());
        assert!(!store.validate_token("guess").unwrap());
        assert!(store.validate_token(" real ").unwrap());
    }

    #[test]
    fn test_http_reservation_allowlist_replaced() {
        let (store, _dir) = open_store();
        store
            .upsert_http_reservation(&HttpReservation {
                tunnel_id: "t1".to_string(),
                subdomain: "app".to_string(),
                allowlist: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
            })
            .unwrap();
        store
            .upsert_http_reservation(&HttpReservation {
                tunnel_id: "t1".to_string(),
                subdomain: "app".to_string(),
                allowlist: vec!["172.16.0.0/12".to_string()],
            })
            .unwrap();

        let reservations = store.list_http_reservations().unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].subdomain, "app");
        assert_eq!(reservations[0].allowlist, vec!["172.16.0.0/12"]);
    }

    #[test]
    fn test_port_reservation_upsert() {
        let (store, _dir) = open_store();
        store
            .upsert_port_reservation(&PortReservation {
                protocol: "tcp".to_string(),
                external_port: 25000,
                tunnel_id: "t1".to_string(),
                reserved: true,
                ..PortReservation::default()
            })
            .unwrap();
        store
            .upsert_port_reservation(&PortReservation {
                protocol: "tcp".to_string(),
                external_port: 25000,
                tunnel_id: "t2".to_string(),
                reserved: true,
                ..PortReservation::default()
            })
            .unwrap();

        let got = store.get_port_reservation("tcp", 25000).unwrap().unwrap();
        assert_eq!(got.tunnel_id, "t2");
        assert!(got.reserved);
        assert!(store.get_port_reservation("udp", 25000).unwrap().is_none());
        assert_eq!(store.list_port_reservations(Some("tcp"), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_tunnel_lifecycle() {
        let (store, _dir) = open_store();
        store
            .upsert_tunnel(&TunnelRecord {
                id: "t1".to_string(),
                name: String::new(),
                protocol: "http".to_string(),
                local_host: "localhost".to_string(),
                local_port: 8081,
                status: "active".to_string(),
                created_at: DateTime::UNIX_EPOCH,
                last_seen: DateTime::UNIX_EPOCH,
            })
            .unwrap();
        store.touch_tunnel("t1").unwrap();
        store.mark_tunnel_status("t1", "inactive").unwrap();

        let tunnels = store.list_tunnels(10).unwrap();
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].status, "inactive");
        assert!(tunnels[0].created_at > DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_custom_domain_round_trip() {
        let (store, _dir) = open_store();
        store
            .upsert_custom_domain(&CustomDomain {
                domain: " App.Example.COM ".to_string(),
                tunnel_id: "t1".to_string(),
                status: "enabled".to_string(),
                ..CustomDomain::default()
            })
            .unwrap();

        let got = store.get_custom_domain("app.example.com").unwrap().unwrap();
        assert_eq!(got.tunnel_id, "t1");
        assert_eq!(got.status, "enabled");
        assert!(store.get_custom_domain("other.example.com").unwrap().is_none());
        assert_eq!(store.list_custom_domains(0).unwrap().len(), 1);
    }

    #[test]
    fn test_metric_rollup_accumulates() {
        let (store, _dir) = open_store();
        let ts = Utc::now();
        store.add_metric("t1", ts, 1, 0, 100, 200).unwrap();
        store.add_metric("t1", ts, 2, 1, 50, 50).unwrap();
        store.add_metric("", ts, 9, 9, 9, 9).unwrap();

        let metrics = store.list_metrics(10).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].tunnel_id, "t1");
        assert_eq!(metrics[0].rollup.req_count, 3);
        assert_eq!(metrics[0].rollup.conn_count, 1);
        assert_eq!(metrics[0].rollup.bytes_in, 150);
        assert_eq!(metrics[0].rollup.bytes_out, 250);
    }

    #[test]
    fn test_insert_log_defaults() {
        let (store, _dir) = open_store();
        store
            .insert_log(&LogEntry {
                tunnel_id: "t1".to_string(),
                timestamp: DateTime::UNIX_EPOCH,
                kind: String::new(),
                remote_addr: "1.2.3.4:9".to_string(),
                summary: "GET /hello".to_string(),
                status: Some(200),
                bytes_in: 0,
                bytes_out: 5,
            })
            .unwrap();

        let logs = store.list_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, "http");
        assert_eq!(logs[0].status, Some(200));
        assert!(logs[0].timestamp > DateTime::UNIX_EPOCH);
    }
}
