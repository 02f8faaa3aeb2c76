use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::embed::{cosine_similarity, EmbeddingClient};
use crate::error::{MemoryError, Result};
use crate::types::*;

/// Hard cap on search result size regardless of the caller's limit.
pub const SEARCH_LIMIT_MAX: usize = 50;
/// Default search result size.
pub const SEARCH_LIMIT_DEFAULT: usize = 12;
/// Maximum tokens considered by the LIKE fallback query.
const LIKE_MAX_TOKENS: usize = 10;
/// Half-life style decay constant for the recency component, in days.
const RECENCY_DECAY_DAYS: f64 = 30.0;

/// Report from one maintenance pass.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub pruned: usize,
    pub vacuumed: bool,
    pub analyzed: bool,
}

/// Scope-partitioned memory store.
///
/// All batch mutations run in a single transaction. The FTS5 index is an
/// external-content table synced manually on every write, mirroring the
/// probe result from init.
pub struct MemoryStore {
    db: Mutex<Connection>,
    fts: bool,
    primary_group: String,
    query_embed_cache: Mutex<HashMap<String, (Vec<f32>, i64)>>,
    behavior_cache: Mutex<HashMap<String, (crate::behavior::BehaviorConfig, i64)>>,
}

impl MemoryStore {
    pub fn new(conn: Connection, primary_group: &str) -> Result<Self> {
        let fts = init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            fts,
            primary_group: primary_group.to_string(),
            query_embed_cache: Mutex::new(HashMap::new()),
            behavior_cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn db_handle(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }

    pub(crate) fn behavior_cached(
        &self,
        key: &str,
        now: i64,
    ) -> Option<crate::behavior::BehaviorConfig> {
        let cache = self.behavior_cache.lock().unwrap();
        let (cfg, at) = cache.get(key)?;
        (now - at < crate::behavior::BEHAVIOR_CACHE_TTL_MS).then(|| cfg.clone())
    }

    pub(crate) fn behavior_cache_put(
        &self,
        key: &str,
        cfg: &crate::behavior::BehaviorConfig,
        now: i64,
    ) {
        let mut cache = self.behavior_cache.lock().unwrap();
        cache.insert(key.to_string(), (cfg.clone(), now));
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts
    }

    /// Effective partition for a write: `global` scope is only honored for
    /// the primary group (stored under the shared `global` namespace);
    /// anyone else is downgraded to group scope.
    fn resolve_partition(&self, group: &str, scope: MemoryScope) -> (MemoryScope, String) {
        match scope {
            MemoryScope::Global if group == self.primary_group => {
                (MemoryScope::Global, "global".to_string())
            }
            MemoryScope::Global => (MemoryScope::Group, group.to_string()),
            other => (other, group.to_string()),
        }
    }

    /// Upsert a batch of memories in one transaction.
    ///
    /// Per input: conflict-key rows are superseded first, then an existing
    /// row with the same normalized content merges (max importance and
    /// confidence, longer content, tag union, embedding cleared on content
    /// change); otherwise a fresh row is inserted. Returns the final rows
    /// in input order.
    #[instrument(skip(self, inputs), fields(group, count = inputs.len()))]
    pub fn upsert_batch(
        &self,
        group: &str,
        inputs: &[MemoryUpsert],
        now: i64,
    ) -> Result<Vec<MemoryItem>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            out.push(self.upsert_one(&tx, group, input, now)?);
        }
        tx.commit()?;
        Ok(out)
    }

    fn upsert_one(
        &self,
        tx: &Transaction<'_>,
        group: &str,
        input: &MemoryUpsert,
        now: i64,
    ) -> Result<MemoryItem> {
        let (scope, group_id) = self.resolve_partition(group, input.scope);

        let subject_id = match scope {
            MemoryScope::User => Some(
                input
                    .subject_id
                    .clone()
                    .ok_or_else(|| {
                        MemoryError::InvalidInput("user-scoped memory requires subject_id".into())
                    })?,
            ),
            _ => None,
        };

        let kind = input.kind.unwrap_or_else(|| input.mem_type.default_kind());
        let normalized = normalize_content(&input.content);
        if normalized.is_empty() {
            return Err(MemoryError::InvalidInput("empty memory content".into()));
        }
        let expires_at = input.ttl_days.map(|d| now + d * 86_400_000);
        let importance = input.importance.clamp(0.0, 1.0);
        let confidence = input.confidence.clamp(0.0, 1.0);

        // Conflict key supersedes every prior row of the same key within the
        // partition, regardless of content.
        if let Some(ref key) = input.conflict_key {
            let doomed: Vec<(i64, String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT rowid, normalized, tags_text FROM memory_items
                     WHERE group_id = ?1 AND scope = ?2 AND subject_id IS ?3
                       AND type = ?4 AND conflict_key = ?5",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![
                        group_id,
                        scope.to_string(),
                        subject_id,
                        input.mem_type.to_string(),
                        key
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                rows.filter_map(|r| r.ok()).collect()
            };
            for (rowid, norm, tags) in &doomed {
                self.fts_delete(tx, *rowid, norm, tags)?;
                tx.execute(
                    "DELETE FROM memory_items WHERE rowid = ?1",
                    rusqlite::params![rowid],
                )?;
            }
        }

        // Content-addressed lookup within the partition.
        let existing = {
            let mut stmt = tx.prepare(
                "SELECT rowid, id, content, importance, confidence, tags_text
                 FROM memory_items
                 WHERE group_id = ?1 AND scope = ?2 AND subject_id IS ?3
                   AND type = ?4 AND normalized = ?5",
            )?;
            stmt.query_row(
                rusqlite::params![
                    group_id,
                    scope.to_string(),
                    subject_id,
                    input.mem_type.to_string(),
                    normalized
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };

        let id = match existing {
            Some((rowid, id, old_content, old_imp, old_conf, old_tags_text)) => {
                let old_tags: Vec<String> =
                    serde_json::from_str(&old_tags_text).unwrap_or_default();
                let mut tags: Vec<String> = old_tags.clone();
                for t in &input.tags {
                    if !tags.contains(t) {
                        tags.push(t.clone());
                    }
                }
                // Longer content wins; newer-but-shorter phrasing is dropped
                // and importance carries the freshness signal instead.
                let content = if input.content.len() > old_content.len() {
                    input.content.clone()
                } else {
                    old_content.clone()
                };
                let content_changed = content != old_content;
                let tags_text = serde_json::to_string(&tags)?;
                let new_norm = normalize_content(&content);

                tx.execute(
                    "UPDATE memory_items SET
                       content = ?1, normalized = ?2, tags_text = ?3,
                       importance = ?4, confidence = ?5, kind = ?6,
                       conflict_key = ?7, updated_at = ?8, expires_at = ?9,
                       source = COALESCE(?10, source),
                       metadata = COALESCE(?11, metadata),
                       embedding = CASE WHEN ?12 THEN NULL ELSE embedding END
                     WHERE rowid = ?13",
                    rusqlite::params![
                        content,
                        new_norm,
                        tags_text,
                        importance.max(old_imp),
                        confidence.max(old_conf),
                        kind.to_string(),
                        input.conflict_key,
                        now,
                        expires_at,
                        input.source,
                        input
                            .metadata
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        content_changed,
                        rowid,
                    ],
                )?;
                let old_norm = normalize_content(&old_content);
                self.fts_delete(tx, rowid, &old_norm, &old_tags_text)?;
                self.fts_insert(tx, rowid, &new_norm, &tags_text)?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let tags_text = serde_json::to_string(&input.tags)?;
                tx.execute(
                    "INSERT INTO memory_items
                     (id, group_id, scope, subject_id, type, kind, conflict_key,
                      content, normalized, tags_text, importance, confidence,
                      created_at, updated_at, expires_at, source, metadata)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13,?14,?15,?16)",
                    rusqlite::params![
                        id,
                        group_id,
                        scope.to_string(),
                        subject_id,
                        input.mem_type.to_string(),
                        kind.to_string(),
                        input.conflict_key,
                        input.content,
                        normalized,
                        tags_text,
                        importance,
                        confidence,
                        now,
                        expires_at,
                        input.source,
                        input
                            .metadata
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                    ],
                )?;
                let rowid = tx.last_insert_rowid();
                self.fts_insert(tx, rowid, &normalized, &tags_text)?;
                id
            }
        };

        self.fetch_by_id(tx, &id)
    }

    fn fts_insert(&self, conn: &Connection, rowid: i64, normalized: &str, tags: &str) -> Result<()> {
        if !self.fts {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO memory_fts(rowid, normalized, tags_text) VALUES (?1, ?2, ?3)",
            rusqlite::params![rowid, normalized, tags],
        )?;
        Ok(())
    }

    fn fts_delete(&self, conn: &Connection, rowid: i64, normalized: &str, tags: &str) -> Result<()> {
        if !self.fts {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO memory_fts(memory_fts, rowid, normalized, tags_text)
             VALUES ('delete', ?1, ?2, ?3)",
            rusqlite::params![rowid, normalized, tags],
        )?;
        Ok(())
    }

    fn fetch_by_id(&self, conn: &Connection, id: &str) -> Result<MemoryItem> {
        Ok(conn.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memory_items m WHERE m.id = ?1"),
            rusqlite::params![id],
            row_to_item,
        )?)
    }

    /// Fetch one memory by id, if present.
    pub fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memory_items m WHERE m.id = ?1"),
            rusqlite::params![id],
            row_to_item,
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Text search visible to `(group, user_id)`: FTS5 with BM25 rerank when
    /// available, AND-ed LIKE tokens otherwise. Expired rows and foreign
    /// user-scoped rows never appear.
    pub fn search(
        &self,
        group: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
        now: i64,
    ) -> Result<Vec<ScoredMemory>> {
        let limit = limit.clamp(1, SEARCH_LIMIT_MAX);
        if self.fts {
            self.search_fts(group, user_id, query, limit, now)
        } else {
            self.search_like(group, user_id, query, limit, now)
        }
    }

    fn search_fts(
        &self,
        group: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
        now: i64,
    ) -> Result<Vec<ScoredMemory>> {
        let tokens = query_tokens(query, usize::MAX);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        // OR of prefix-matched tokens: `"rust"* OR "asyn"*`.
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{t}\"*"))
            .collect::<Vec<_>>()
            .join(" OR ");

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MEMORY_COLUMNS}, bm25(memory_fts) AS rank
             FROM memory_items m JOIN memory_fts f ON m.rowid = f.rowid
             WHERE memory_fts MATCH ?1
               AND (m.group_id = ?2 OR m.group_id = 'global')
               AND (m.scope != 'user' OR m.subject_id = ?3)
               AND (m.expires_at IS NULL OR m.expires_at > ?4)
             ORDER BY rank
             LIMIT ?5",
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![match_expr, group, user_id, now, limit as i64],
            |row| {
                let item = row_to_item(row)?;
                let rank: f64 = row.get(MEMORY_COLUMN_COUNT)?;
                Ok((item, rank))
            },
        )?;

        let mut scored: Vec<ScoredMemory> = rows
            .filter_map(|r| r.ok())
            .map(|(item, rank)| {
                // fts5 rank is the negated BM25 score (lower = better).
                // Folded through 1/(1+d) with d = 1/bm25 it lands in (0,1).
                let bm25 = (-rank).max(1e-6);
                let relevance = 1.0 / (1.0 + 1.0 / bm25);
                let score = 0.55 * relevance
                    + 0.30 * item.importance
                    + 0.15 * recency_factor(item.updated_at, now);
                ScoredMemory { item, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }

    fn search_like(
        &self,
        group: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
        now: i64,
    ) -> Result<Vec<ScoredMemory>> {
        let tokens = query_tokens(query, LIKE_MAX_TOKENS);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory_items m
             WHERE (m.group_id = ?1 OR m.group_id = 'global')
               AND (m.scope != 'user' OR m.subject_id = ?2)
               AND (m.expires_at IS NULL OR m.expires_at > ?3)"
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(group.to_string()),
            Box::new(user_id.map(str::to_string)),
            Box::new(now),
        ];
        for token in &tokens {
            let idx = params.len() + 1;
            sql.push_str(&format!(
                " AND (m.normalized LIKE ?{idx} OR m.tags_text LIKE ?{idx})"
            ));
            params.push(Box::new(format!("%{token}%")));
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            row_to_item,
        )?;

        let mut scored: Vec<ScoredMemory> = rows
            .filter_map(|r| r.ok())
            .map(|item| {
                let hit = tokens
                    .iter()
                    .filter(|t| item.normalized.contains(*t) || item.tags.iter().any(|g| g.contains(*t)))
                    .count();
                let ratio = hit as f64 / tokens.len() as f64;
                let score = 0.5 * ratio
                    + 0.3 * item.importance
                    + 0.2 * recency_factor(item.updated_at, now);
                ScoredMemory { item, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Hybrid recall: text search, optionally blended with cosine similarity
    /// over the embedded candidate pool, rendered into budgeted lines.
    #[instrument(skip(self, embedder, cfg), fields(group = %req.group))]
    pub async fn hybrid_recall(
        &self,
        req: &RecallRequest,
        embedder: Option<&dyn EmbeddingClient>,
        cfg: &dotclaw_core::config::EmbeddingsConfig,
        now: i64,
    ) -> Result<RecallOutcome> {
        let mut scored = self.search(
            &req.group,
            req.user_id.as_deref(),
            &req.query,
            req.max_results.max(SEARCH_LIMIT_DEFAULT),
            now,
        )?;

        if let Some(embedder) = embedder {
            if cfg.enabled && req.query.len() >= cfg.min_query_chars {
                match self
                    .blend_with_embeddings(req, embedder, cfg, &mut scored, now)
                    .await
                {
                    Ok(blended) => debug!(blended, "embedding blend applied"),
                    // Vector recall is an enhancement; text results stand alone.
                    Err(e) => warn!(error = %e, "embedding blend skipped"),
                }
            }
        }

        scored.retain(|s| s.score >= req.min_score);
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(req.max_results);

        let mut outcome = RecallOutcome::default();
        for s in &scored {
            let line = format!("({}) {}", s.item.mem_type, s.item.content);
            let cost = estimate_tokens(&line);
            if outcome.estimated_tokens + cost > req.max_tokens {
                break;
            }
            outcome.estimated_tokens += cost;
            outcome.lines.push(line);
            outcome.hits.push(s.item.id.clone());
        }

        if !outcome.hits.is_empty() {
            self.touch_accessed(&outcome.hits, now)?;
        }
        Ok(outcome)
    }

    async fn blend_with_embeddings(
        &self,
        req: &RecallRequest,
        embedder: &dyn EmbeddingClient,
        cfg: &dotclaw_core::config::EmbeddingsConfig,
        scored: &mut Vec<ScoredMemory>,
        now: i64,
    ) -> Result<usize> {
        let candidates = self.embedded_candidates(
            &req.group,
            req.user_id.as_deref(),
            cfg.max_candidates,
            now,
        )?;
        if candidates.len() < cfg.min_items {
            return Ok(0);
        }

        let query_vec = self.query_embedding(&req.query, embedder, cfg, now).await?;
        let weight = cfg.weight.clamp(0.0, 1.0);

        let mut by_id: HashMap<String, ScoredMemory> = scored
            .drain(..)
            .map(|s| (s.item.id.clone(), s))
            .collect();

        let mut blended = 0usize;
        for item in candidates {
            let Some(ref emb) = item.embedding else { continue };
            let cos = cosine_similarity(&query_vec, emb).max(0.0);
            blended += 1;
            match by_id.get_mut(&item.id) {
                Some(s) => s.score = (1.0 - weight) * s.score + weight * cos,
                None => {
                    by_id.insert(
                        item.id.clone(),
                        ScoredMemory {
                            score: weight * cos,
                            item,
                        },
                    );
                }
            }
        }
        scored.extend(by_id.into_values());
        Ok(blended)
    }

    async fn query_embedding(
        &self,
        query: &str,
        embedder: &dyn EmbeddingClient,
        cfg: &dotclaw_core::config::EmbeddingsConfig,
        now: i64,
    ) -> Result<Vec<f32>> {
        {
            let cache = self.query_embed_cache.lock().unwrap();
            if let Some((vec, at)) = cache.get(query) {
                if now - at < cfg.query_cache_ttl_ms {
                    return Ok(vec.clone());
                }
            }
        }
        let mut vecs = embedder.embed(&[query.to_string()]).await?;
        let vec = vecs
            .pop()
            .ok_or_else(|| MemoryError::Embedding("empty embedding response".into()))?;
        let mut cache = self.query_embed_cache.lock().unwrap();
        cache.insert(query.to_string(), (vec.clone(), now));
        Ok(vec)
    }

    fn embedded_candidates(
        &self,
        group: &str,
        user_id: Option<&str>,
        limit: usize,
        now: i64,
    ) -> Result<Vec<MemoryItem>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memory_items m
             WHERE m.embedding IS NOT NULL
               AND (m.group_id = ?1 OR m.group_id = 'global')
               AND (m.scope != 'user' OR m.subject_id = ?2)
               AND (m.expires_at IS NULL OR m.expires_at > ?3)
             ORDER BY m.updated_at DESC
             LIMIT ?4",
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![group, user_id, now, limit as i64],
            row_to_item,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// High-importance identity/preference/relationship/project memories for
    /// one user, rendered as profile lines, strongest first.
    pub fn user_profile(&self, group: &str, user_id: &str, top_k: usize) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memory_items m
             WHERE (m.group_id = ?1 OR m.group_id = 'global')
               AND (m.scope != 'user' OR m.subject_id = ?2)
               AND m.type IN ('identity', 'preference', 'relationship', 'project')
             ORDER BY m.importance DESC, m.updated_at DESC
             LIMIT ?3",
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![group, user_id, top_k as i64],
            row_to_item,
        )?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|item| format!("({}) {}", item.mem_type, item.content))
            .collect())
    }

    /// Per-scope counts visible to a group.
    pub fn stats(&self, group: &str) -> Result<MemoryStats> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT scope, COUNT(*) FROM memory_items
             WHERE group_id = ?1 OR group_id = 'global'
             GROUP BY scope",
        )?;
        let rows = stmt.query_map(rusqlite::params![group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut stats = MemoryStats::default();
        for r in rows.filter_map(|r| r.ok()) {
            match r.0.as_str() {
                "user" => stats.user = r.1,
                "group" => stats.group = r.1,
                "global" => stats.global = r.1,
                _ => {}
            }
            stats.total += r.1;
        }
        Ok(stats)
    }

    fn touch_accessed(&self, ids: &[String], now: i64) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE memory_items SET last_accessed_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Items still waiting for an embedding, oldest first.
    pub fn missing_embeddings(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, content FROM memory_items
             WHERE embedding IS NULL
             ORDER BY updated_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE memory_items SET embedding = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(embedding)?, id],
        )?;
        Ok(())
    }

    /// Record an ingested source, keyed by `(group, path)` with a SHA-256
    /// content hash. Returns true when the content changed since the last
    /// indexing (or the source is new).
    pub fn record_source(
        &self,
        group: &str,
        source_type: &str,
        path: &str,
        content: &[u8],
        now: i64,
    ) -> Result<bool> {
        use sha2::{Digest, Sha256};
        let hash = hex::encode(Sha256::digest(content));

        let db = self.db.lock().unwrap();
        let prev: Option<String> = db
            .query_row(
                "SELECT hash FROM memory_sources WHERE group_id = ?1 AND path = ?2",
                rusqlite::params![group, path],
                |row| row.get(0),
            )
            .ok();
        if prev.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }
        db.execute(
            "INSERT INTO memory_sources (id, group_id, type, path, hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(group_id, path) DO UPDATE SET
               type = excluded.type, hash = excluded.hash,
               indexed_at = excluded.indexed_at",
            rusqlite::params![Uuid::new_v4().to_string(), group, source_type, path, hash, now],
        )?;
        Ok(true)
    }

    /// Retention pass: expire, prune over-cap low-importance rows, and run
    /// VACUUM weekly / ANALYZE daily when enabled.
    #[instrument(skip(self, cfg))]
    pub fn maintain(
        &self,
        cfg: &dotclaw_core::config::MemoryMaintenanceConfig,
        now: i64,
    ) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let mut db = self.db.lock().unwrap();

        report.expired = db.execute(
            "DELETE FROM memory_items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            rusqlite::params![now],
        )?;

        let total: i64 = db.query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0))?;
        if total as usize > cfg.max_items {
            let overflow = total as usize - cfg.max_items;
            report.pruned = db.execute(
                "DELETE FROM memory_items WHERE rowid IN (
                   SELECT rowid FROM memory_items
                   WHERE importance < ?1
                   ORDER BY importance ASC, updated_at ASC
                   LIMIT ?2)",
                rusqlite::params![cfg.prune_importance_threshold, overflow as i64],
            )?;
        }
        if self.fts && (report.expired > 0 || report.pruned > 0) {
            // Bulk deletes bypass the manual sync; rebuild the index once.
            db.execute_batch("INSERT INTO memory_fts(memory_fts) VALUES('rebuild');")?;
        }

        if cfg.vacuum_enabled
            && self.meta_due(&db, "last_vacuum_at", cfg.vacuum_interval_days * 86_400_000, now)?
        {
            db.execute_batch("VACUUM;")?;
            self.meta_set(&db, "last_vacuum_at", now)?;
            report.vacuumed = true;
        }
        if self.meta_due(&db, "last_analyze_at", 86_400_000, now)? {
            db.execute_batch("ANALYZE;")?;
            self.meta_set(&db, "last_analyze_at", now)?;
            report.analyzed = true;
        }

        Ok(report)
    }

    fn meta_due(&self, conn: &Connection, key: &str, interval_ms: i64, now: i64) -> Result<bool> {
        let last: Option<String> = conn
            .query_row(
                "SELECT value FROM memory_meta WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .ok();
        Ok(match last.and_then(|v| v.parse::<i64>().ok()) {
            Some(at) => now - at >= interval_ms,
            None => true,
        })
    }

    fn meta_set(&self, conn: &Connection, key: &str, now: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO memory_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, now.to_string()],
        )?;
        Ok(())
    }
}

/// Time-decay factor in (0, 1]: 1.0 for fresh rows, e^-1 after 30 days.
fn recency_factor(updated_at: i64, now: i64) -> f64 {
    let age_days = ((now - updated_at).max(0) as f64) / 86_400_000.0;
    (-age_days / RECENCY_DECAY_DAYS).exp()
}

/// Lowercased alphanumeric tokens of a query, capped at `max`.
fn query_tokens(query: &str, max: usize) -> Vec<String> {
    normalize_content(query)
        .split(' ')
        .filter(|t| !t.is_empty())
        .take(max)
        .map(str::to_string)
        .collect()
}

const MEMORY_COLUMNS: &str = "m.id, m.group_id, m.scope, m.subject_id, m.type, m.kind, \
     m.conflict_key, m.content, m.normalized, m.tags_text, m.importance, m.confidence, \
     m.created_at, m.updated_at, m.last_accessed_at, m.expires_at, m.source, m.metadata, \
     m.embedding";
const MEMORY_COLUMN_COUNT: usize = 19;

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let scope: String = row.get(2)?;
    let mem_type: String = row.get(4)?;
    let kind: String = row.get(5)?;
    let tags_text: String = row.get(9)?;
    let metadata: Option<String> = row.get(17)?;
    let embedding: Option<String> = row.get(18)?;
    Ok(MemoryItem {
        id: row.get(0)?,
        group: row.get(1)?,
        scope: scope.parse().unwrap_or(MemoryScope::Group),
        subject_id: row.get(3)?,
        mem_type: mem_type.parse().unwrap_or(MemoryType::Note),
        kind: kind.parse().unwrap_or(MemoryKind::Semantic),
        conflict_key: row.get(6)?,
        content: row.get(7)?,
        normalized: row.get(8)?,
        tags: serde_json::from_str(&tags_text).unwrap_or_default(),
        importance: row.get(10)?,
        confidence: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        last_accessed_at: row.get(14)?,
        expires_at: row.get(15)?,
        source: row.get(16)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
    })
}
