// redwall/src/sink/store.rs
//
// SQLite persistence handle. One connection behind an async mutex; SQLite
// serializes writers anyway, and WAL keeps the read-side API out of our way.
// The daemon creates its tables on open so it runs standalone; the read-side
// API owns everything else about the schema.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::events::{
    LoggedEvent, PolicyAction, PolicyRule, SecurityDecision, Severity, Tenant,
};

#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open event store")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tenants (
                id            TEXT PRIMARY KEY,
                api_key       TEXT NOT NULL UNIQUE,
                monthly_limit INTEGER NOT NULL DEFAULT 10000,
                blocked       INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                ts                TEXT NOT NULL,
                tenant_id         TEXT NOT NULL,
                agent_id          TEXT,
                model             TEXT NOT NULL,
                prompt_tokens     INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                cost_usd          REAL NOT NULL,
                latency_ms        INTEGER NOT NULL,
                tool_names        TEXT NOT NULL DEFAULT '[]',
                request_hash      TEXT NOT NULL,
                response_preview  TEXT NOT NULL DEFAULT '',
                risk_score        INTEGER NOT NULL DEFAULT 0,
                blocked           INTEGER NOT NULL DEFAULT 0,
                flags             TEXT NOT NULL DEFAULT '[]',
                raw_request       TEXT NOT NULL,
                raw_response      TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_tenant_ts ON events(tenant_id, ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS policy_rules (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id   TEXT NOT NULL,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                condition   TEXT NOT NULL,
                action      TEXT NOT NULL,
                severity    TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                hits        INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_tenant ON policy_rules(tenant_id, enabled)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocked_agents (
                tenant_id  TEXT NOT NULL,
                agent_id   TEXT NOT NULL,
                reason     TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, agent_id)
            )",
            [],
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // ── Tenants ───────────────────────────────────────────────────────────────

    pub async fn tenant_by_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().await;
        let tenant = conn
            .query_row(
                "SELECT id, api_key, monthly_limit, blocked FROM tenants WHERE api_key = ?1",
                params![api_key],
                |row| {
                    Ok(Tenant {
                        id:            row.get(0)?,
                        api_key:       row.get(1)?,
                        monthly_limit: row.get(2)?,
                        blocked:       row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    pub async fn create_tenant(&self, id: &str, api_key: &str, monthly_limit: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tenants (id, api_key, monthly_limit) VALUES (?1, ?2, ?3)",
            params![id, api_key, monthly_limit],
        )?;
        Ok(())
    }

    /// Events logged for a tenant since the start of the current calendar month.
    pub async fn events_this_month(&self, tenant_id: &str) -> Result<u32> {
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let conn = self.conn.lock().await;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE tenant_id = ?1 AND ts >= ?2",
            params![tenant_id, month_start.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Insert a pre-analysis event and return it with its assigned id.
    pub async fn insert_event(&self, mut event: LoggedEvent) -> Result<LoggedEvent> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (
                ts, tenant_id, agent_id, model, prompt_tokens, completion_tokens,
                cost_usd, latency_ms, tool_names, request_hash, response_preview,
                risk_score, blocked, flags, raw_request, raw_response
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                event.timestamp.to_rfc3339(),
                event.tenant_id,
                event.agent_id,
                event.model,
                event.prompt_tokens,
                event.completion_tokens,
                event.cost_usd,
                event.latency_ms as i64,
                serde_json::to_string(&event.tool_names)?,
                event.request_hash,
                event.response_preview,
                event.risk_score,
                event.blocked as i64,
                serde_json::to_string(&event.flags)?,
                event.raw_request,
                event.raw_response,
            ],
        )?;
        event.id = conn.last_insert_rowid();
        Ok(event)
    }

    /// Project an analysis result onto its row. Single UPDATE, so readers see
    /// either the pre-analysis row or the fully scored one.
    pub async fn update_security_result(&self, id: i64, decision: &SecurityDecision) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE events SET risk_score = ?2, blocked = ?3, flags = ?4 WHERE id = ?1",
            params![
                id,
                decision.risk_score,
                decision.blocked as i64,
                serde_json::to_string(&decision.flags)?,
            ],
        )?;
        Ok(())
    }

    pub async fn event_by_id(&self, id: i64) -> Result<Option<LoggedEvent>> {
        let conn = self.conn.lock().await;
        let event = conn
            .query_row(
                "SELECT id, ts, tenant_id, agent_id, model, prompt_tokens, completion_tokens,
                        cost_usd, latency_ms, tool_names, request_hash, response_preview,
                        risk_score, blocked, flags, raw_request, raw_response
                 FROM events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    pub async fn recent_events(&self, tenant_id: &str, limit: u32) -> Result<Vec<LoggedEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, ts, tenant_id, agent_id, model, prompt_tokens, completion_tokens,
                    cost_usd, latency_ms, tool_names, request_hash, response_preview,
                    risk_score, blocked, flags, raw_request, raw_response
             FROM events WHERE tenant_id = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id, limit], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    // ── Policy rules ──────────────────────────────────────────────────────────

    pub async fn enabled_rules(&self, tenant_id: &str) -> Result<Vec<PolicyRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, condition, action, severity,
                    enabled, hits, created_at
             FROM policy_rules WHERE tenant_id = ?1 AND enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    pub async fn create_rule(
        &self,
        tenant_id: &str,
        name: &str,
        description: &str,
        condition: &str,
        action: PolicyAction,
        severity: Severity,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO policy_rules (tenant_id, name, description, condition, action, severity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tenant_id,
                name,
                description,
                condition,
                action.to_string(),
                severity.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE policy_rules SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    pub async fn bump_rule_hits(&self, ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock().await;
        for id in ids {
            conn.execute(
                "UPDATE policy_rules SET hits = hits + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    // ── Blocked agents ────────────────────────────────────────────────────────

    pub async fn is_agent_blocked(&self, tenant_id: &str, agent_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blocked_agents WHERE tenant_id = ?1 AND agent_id = ?2",
                params![tenant_id, agent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn block_agent(&self, tenant_id: &str, agent_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO blocked_agents (tenant_id, agent_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, agent_id, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<LoggedEvent> {
    let ts: String = row.get(1)?;
    let tool_names: String = row.get(9)?;
    let flags: String = row.get(14)?;
    Ok(LoggedEvent {
        id:                row.get(0)?,
        timestamp:         ts
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        tenant_id:         row.get(2)?,
        agent_id:          row.get(3)?,
        model:             row.get(4)?,
        prompt_tokens:     row.get(5)?,
        completion_tokens: row.get(6)?,
        cost_usd:          row.get(7)?,
        latency_ms:        row.get::<_, i64>(8)? as u64,
        tool_names:        serde_json::from_str(&tool_names).unwrap_or_default(),
        request_hash:      row.get(10)?,
        response_preview:  row.get(11)?,
        risk_score:        row.get::<_, i64>(12)? as u8,
        blocked:           row.get::<_, i64>(13)? != 0,
        flags:             serde_json::from_str(&flags).unwrap_or_default(),
        raw_request:       row.get(15)?,
        raw_response:      row.get(16)?,
    })
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<PolicyRule> {
    let action: String = row.get(5)?;
    let severity: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    Ok(PolicyRule {
        id:          row.get(0)?,
        tenant_id:   row.get(1)?,
        name:        row.get(2)?,
        description: row.get(3)?,
        condition:   row.get(4)?,
        action:      PolicyAction::parse(&action).unwrap_or(PolicyAction::Alert),
        severity:    Severity::parse(&severity).unwrap_or(Severity::Low),
        enabled:     row.get::<_, i64>(7)? != 0,
        hits:        row.get::<_, i64>(8)? as u64,
        created_at:  created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AnomalyReport, InjectionReport, PolicyReport};
    use tempfile::TempDir;

    fn sample_event(tenant: &str) -> LoggedEvent {
        LoggedEvent {
            id: 0,
            timestamp: Utc::now(),
            tenant_id: tenant.to_string(),
            agent_id: Some("agent-1".into()),
            model: "gpt-4o".into(),
            prompt_tokens: 120,
            completion_tokens: 40,
            cost_usd: 0.0007,
            latency_ms: 321,
            tool_names: vec!["web_fetch".into()],
            request_hash: "abc123".into(),
            response_preview: "ok".into(),
            risk_score: 0,
            blocked: false,
            flags: vec![],
            raw_request: "{\"model\":\"gpt-4o\"}".into(),
            raw_response: "{\"ok\":true}".into(),
        }
    }

    async fn open_store(dir: &TempDir) -> EventStore {
        EventStore::open(dir.path().join("events.db").to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let a = store.insert_event(sample_event("t1")).await.unwrap();
        let b = store.insert_event(sample_event("t1")).await.unwrap();
        assert!(a.id > 0 && b.id > a.id);

        let loaded = store.event_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.tenant_id, "t1");
        assert_eq!(loaded.tool_names, vec!["web_fetch".to_string()]);
        assert_eq!(loaded.risk_score, 0);
        assert!(!loaded.blocked);
    }

    #[tokio::test]
    async fn security_update_projects_decision_fields() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let event = store.insert_event(sample_event("t1")).await.unwrap();

        let decision = SecurityDecision {
            event_id: event.id,
            risk_score: 73,
            blocked: true,
            flags: vec!["credential_access".into(), "jailbreak".into()],
            anomaly: AnomalyReport::default(),
            injection: InjectionReport::default(),
            policy: PolicyReport::default(),
            processing_ms: 4,
        };
        store.update_security_result(event.id, &decision).await.unwrap();

        let loaded = store.event_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.risk_score, 73);
        assert!(loaded.blocked);
        assert_eq!(loaded.flags, vec!["credential_access", "jailbreak"]);
        // Untouched columns survive the update.
        assert_eq!(loaded.raw_request, "{\"model\":\"gpt-4o\"}");
    }

    #[tokio::test]
    async fn tenant_lookup_and_monthly_count() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.create_tenant("t1", "key-1", 500).await.unwrap();

        let tenant = store.tenant_by_key("key-1").await.unwrap().unwrap();
        assert_eq!(tenant.id, "t1");
        assert_eq!(tenant.monthly_limit, 500);
        assert!(!tenant.blocked);
        assert!(store.tenant_by_key("nope").await.unwrap().is_none());

        assert_eq!(store.events_this_month("t1").await.unwrap(), 0);
        store.insert_event(sample_event("t1")).await.unwrap();
        store.insert_event(sample_event("t1")).await.unwrap();
        store.insert_event(sample_event("t2")).await.unwrap();
        assert_eq!(store.events_this_month("t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blocked_agents_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert!(!store.is_agent_blocked("t1", "a1").await.unwrap());
        store.block_agent("t1", "a1", "streamed block").await.unwrap();
        store.block_agent("t1", "a1", "twice is fine").await.unwrap();
        assert!(store.is_agent_blocked("t1", "a1").await.unwrap());
        assert!(!store.is_agent_blocked("t2", "a1").await.unwrap());
    }

    #[tokio::test]
    async fn recent_events_scopes_by_tenant() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        for _ in 0..3 {
            store.insert_event(sample_event("t1")).await.unwrap();
        }
        store.insert_event(sample_event("t2")).await.unwrap();

        let events = store.recent_events("t1", 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.tenant_id == "t1"));
    }
}
