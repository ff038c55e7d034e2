use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use tandem_core::{
    change_group::{ActionKind, ActionStatus, ChangeGroup, ChangeStatus, MigrationAction},
    conflict::{
        ConflictResolutionRule, ConflictStatus, ConflictTarget, MigrationConflict, ResolutionOutcome,
        ResolvedBy,
    },
    ids::*,
    link::{
        ArtifactLink, LinkActionKind, LinkActionStatus, LinkChangeAction, LinkChangeGroup,
        LinkGroupStatus, LinkTargetKind,
    },
};

use crate::error::StorageError;
use crate::traits::{GroupQuery, Page, Storage};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {raw}: {e}")))
}

fn map_constraint(err: rusqlite::Error, what: &str) -> StorageError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            StorageError::ConstraintViolation(what.to_string())
        }
        other => StorageError::Sqlite(other),
    }
}

/// `'a', 'b'` list of terminal group statuses for use in SQL.
fn terminal_statuses_sql() -> String {
    ChangeStatus::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// How long a write waits on another connection's lock before failing
    /// as busy.
    pub fn set_busy_timeout(&mut self, timeout: std::time::Duration) -> Result<(), StorageError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Take the write lock up front so concurrent sessions wait on
    /// `busy_timeout` instead of failing a read-to-write upgrade.
    fn write_tx(&mut self) -> Result<Transaction<'_>, StorageError> {
        Ok(self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

// ---------------------------------------------------------------------------
// Row readers
// ---------------------------------------------------------------------------

const GROUP_COLUMNS: &str = "group_id, session_id, source_id, name, owner, comment, change_time, execution_order, status, contains_backlogged";

const ACTION_COLUMNS: &str = "action_id, group_id, action_order, kind, path, from_path, content_type, item, version, translated_path, status, conflicted";

const CONFLICT_COLUMNS: &str = "conflict_id, session_id, source_id, conflict_type, target_kind, target_id, group_id, scope_hint, details, fingerprint, status, resolved_by_rule, retry_count, created_at, resolved_by, outcome";

const RULE_COLUMNS: &str = "rule_id, session_id, conflict_type, scope, action, details, data, created_at";

const LINK_GROUP_COLUMNS: &str = "group_id, session_id, source_id, name, status, contains_conflicted, age, retries_at_age, next_attempt_at";

const LINK_ACTION_COLUMNS: &str = "a.action_id, a.group_id, a.kind, a.source_artifact_id, a.source_uri, a.target_uri, a.link_type, a.comment, a.is_locked, a.target_kind, a.status, a.conflicted, a.server_link_change_id";

fn read_group_header(row: &Row) -> Result<ChangeGroup, StorageError> {
    let session_bytes: Vec<u8> = row.get(1)?;
    let source_bytes: Vec<u8> = row.get(2)?;
    let change_time: String = row.get(6)?;
    let status: String = row.get(8)?;
    Ok(ChangeGroup {
        group_id: ChangeGroupId::from_raw(row.get(0)?),
        session_id: SessionId::from_bytes(to_array::<16>(session_bytes, "session_id")?),
        source_id: SourceId::from_bytes(to_array::<16>(source_bytes, "source_id")?),
        name: row.get(3)?,
        owner: row.get(4)?,
        comment: row.get(5)?,
        change_time: parse_time(&change_time)?,
        execution_order: row.get(7)?,
        status: ChangeStatus::parse(&status)?,
        contains_backlogged: row.get(9)?,
        actions: Vec::new(),
    })
}

fn read_action(row: &Row) -> Result<MigrationAction, StorageError> {
    let kind: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(MigrationAction {
        action_id: ActionId::from_raw(row.get(0)?),
        group_id: ChangeGroupId::from_raw(row.get(1)?),
        order: row.get(2)?,
        kind: ActionKind::parse(&kind)?,
        path: row.get(4)?,
        from_path: row.get(5)?,
        content_type: row.get(6)?,
        item: row.get(7)?,
        version: row.get(8)?,
        translated_path: row.get(9)?,
        status: ActionStatus::parse(&status)?,
        conflicted: row.get(11)?,
    })
}

fn load_actions(conn: &Connection, group_id: ChangeGroupId) -> Result<Vec<MigrationAction>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTION_COLUMNS} FROM change_actions WHERE group_id = ?1 ORDER BY action_order, action_id"
    ))?;
    let mut rows = stmt.query(rusqlite::params![group_id.raw()])?;
    let mut actions = Vec::new();
    while let Some(row) = rows.next()? {
        actions.push(read_action(row)?);
    }
    Ok(actions)
}

fn read_conflict(row: &Row) -> Result<MigrationConflict, StorageError> {
    let session_bytes: Vec<u8> = row.get(1)?;
    let source_bytes: Vec<u8> = row.get(2)?;
    let target_kind: String = row.get(4)?;
    let group_id: Option<i64> = row.get(6)?;
    let fingerprint: Option<Vec<u8>> = row.get(9)?;
    let status: String = row.get(10)?;
    let resolved_by_rule: Option<i64> = row.get(11)?;
    let created_at: String = row.get(13)?;
    let resolved_by: Option<String> = row.get(14)?;
    let outcome: Option<Vec<u8>> = row.get(15)?;
    Ok(MigrationConflict {
        conflict_id: ConflictId::from_raw(row.get(0)?),
        session_id: SessionId::from_bytes(to_array::<16>(session_bytes, "session_id")?),
        source_id: SourceId::from_bytes(to_array::<16>(source_bytes, "source_id")?),
        conflict_type: row.get(3)?,
        target: ConflictTarget::from_parts(&target_kind, row.get(5)?)?,
        group_id: group_id.map(ChangeGroupId::from_raw),
        scope_hint: row.get(7)?,
        details: row.get(8)?,
        fingerprint: fingerprint
            .map(|bytes| to_array::<32>(bytes, "fingerprint").map(Fingerprint::from_bytes))
            .transpose()?,
        status: ConflictStatus::parse(&status)?,
        resolved_by_rule: resolved_by_rule.map(RuleId::from_raw),
        resolved_by: resolved_by.as_deref().map(ResolvedBy::parse).transpose()?,
        outcome: outcome
            .as_deref()
            .map(ResolutionOutcome::from_msgpack)
            .transpose()?,
        retry_count: row.get(12)?,
        created_at: parse_time(&created_at)?,
    })
}

fn read_rule(row: &Row) -> Result<ConflictResolutionRule, StorageError> {
    let session_bytes: Vec<u8> = row.get(1)?;
    let data: Vec<u8> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(ConflictResolutionRule {
        rule_id: RuleId::from_raw(row.get(0)?),
        session_id: SessionId::from_bytes(to_array::<16>(session_bytes, "session_id")?),
        conflict_type: row.get(2)?,
        scope: row.get(3)?,
        action: row.get(4)?,
        details: row.get(5)?,
        data: ConflictResolutionRule::data_from_msgpack(&data)?,
        created_at: parse_time(&created_at)?,
    })
}

fn read_link_group_header(row: &Row) -> Result<LinkChangeGroup, StorageError> {
    let session_bytes: Vec<u8> = row.get(1)?;
    let source_bytes: Vec<u8> = row.get(2)?;
    let status: String = row.get(4)?;
    let next_attempt_at: Option<String> = row.get(8)?;
    Ok(LinkChangeGroup {
        group_id: LinkGroupId::from_raw(row.get(0)?),
        session_id: SessionId::from_bytes(to_array::<16>(session_bytes, "session_id")?),
        source_id: SourceId::from_bytes(to_array::<16>(source_bytes, "source_id")?),
        name: row.get(3)?,
        status: LinkGroupStatus::parse(&status)?,
        contains_conflicted: row.get(5)?,
        age: row.get(6)?,
        retries_at_age: row.get(7)?,
        next_attempt_at: next_attempt_at.as_deref().map(parse_time).transpose()?,
        actions: Vec::new(),
    })
}

fn read_link_action(row: &Row) -> Result<LinkChangeAction, StorageError> {
    let kind: String = row.get(2)?;
    let target_kind: String = row.get(9)?;
    let status: String = row.get(10)?;
    Ok(LinkChangeAction {
        action_id: LinkActionId::from_raw(row.get(0)?),
        group_id: LinkGroupId::from_raw(row.get(1)?),
        kind: LinkActionKind::parse(&kind)?,
        link: ArtifactLink {
            source_artifact_id: row.get(3)?,
            source_uri: row.get(4)?,
            target_uri: row.get(5)?,
            link_type: row.get(6)?,
            comment: row.get(7)?,
            is_locked: row.get(8)?,
            target_kind: LinkTargetKind::parse(&target_kind)?,
        },
        status: LinkActionStatus::parse(&status)?,
        conflicted: row.get(11)?,
        server_link_change_id: row.get(12)?,
    })
}

fn load_link_actions(conn: &Connection, group_id: LinkGroupId) -> Result<Vec<LinkChangeAction>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINK_ACTION_COLUMNS} FROM link_change_actions a WHERE a.group_id = ?1 ORDER BY a.action_id"
    ))?;
    let mut rows = stmt.query(rusqlite::params![group_id.raw()])?;
    let mut actions = Vec::new();
    while let Some(row) = rows.next()? {
        actions.push(read_link_action(row)?);
    }
    Ok(actions)
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

fn insert_action(
    tx: &rusqlite::Transaction,
    group_id: ChangeGroupId,
    action: &mut MigrationAction,
) -> Result<(), StorageError> {
    action.group_id = group_id;
    tx.execute(
        "INSERT INTO change_actions (group_id, action_order, kind, path, from_path, content_type, item, version, translated_path, status, conflicted, fingerprint) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            group_id.raw(),
            action.order,
            action.kind.as_str(),
            action.path,
            action.from_path,
            action.content_type,
            action.item,
            action.version,
            action.translated_path,
            action.status.as_str(),
            action.conflicted,
            action.fingerprint().as_bytes().as_slice(),
        ],
    )?;
    action.action_id = ActionId::from_raw(tx.last_insert_rowid());
    Ok(())
}

fn insert_link_action(
    tx: &rusqlite::Transaction,
    group_id: LinkGroupId,
    action: &mut LinkChangeAction,
) -> Result<(), StorageError> {
    action.group_id = group_id;
    tx.execute(
        "INSERT INTO link_change_actions (group_id, kind, source_artifact_id, source_uri, target_uri, link_type, comment, is_locked, target_kind, status, conflicted, server_link_change_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            group_id.raw(),
            action.kind.as_str(),
            action.link.source_artifact_id,
            action.link.source_uri,
            action.link.target_uri,
            action.link.link_type,
            action.link.comment,
            action.link.is_locked,
            action.link.target_kind.as_str(),
            action.status.as_str(),
            action.conflicted,
            action.server_link_change_id,
        ],
    )?;
    action.action_id = LinkActionId::from_raw(tx.last_insert_rowid());
    Ok(())
}

impl SqliteStorage {
    fn group_filter(query: &GroupQuery) -> (String, Vec<Value>) {
        let mut clause = String::from("session_id = ?");
        let mut values = vec![Value::Blob(query.session_id.as_bytes().to_vec())];
        if let Some(source_id) = query.source_id {
            clause.push_str(" AND source_id = ?");
            values.push(Value::Blob(source_id.as_bytes().to_vec()));
        }
        if !query.statuses.is_empty() {
            clause.push_str(&format!(" AND status IN ({})", placeholders(query.statuses.len())));
            values.extend(query.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        if query.exclude_backlogged {
            clause.push_str(" AND contains_backlogged = 0");
        }
        (clause, values)
    }

    fn query_conflicts(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MigrationConflict>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE {clause} ORDER BY conflict_id"
        ))?;
        let mut rows = stmt.query(params)?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next()? {
            conflicts.push(read_conflict(row)?);
        }
        Ok(conflicts)
    }
}

impl Storage for SqliteStorage {
    fn create_change_groups(&mut self, groups: &mut [ChangeGroup]) -> Result<(), StorageError> {
        let tx = self.write_tx()?;

        for group in groups.iter_mut() {
            if group.group_id.is_persisted() {
                return Err(StorageError::Invariant(format!(
                    "change group {} is already persisted",
                    group.group_id
                )));
            }
            let last_order: i64 = tx.query_row(
                "SELECT COALESCE(MAX(execution_order), 0) FROM change_groups WHERE session_id = ?1",
                rusqlite::params![group.session_id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO change_groups (session_id, source_id, name, owner, comment, change_time, execution_order, status, contains_backlogged) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    group.session_id.as_bytes().as_slice(),
                    group.source_id.as_bytes().as_slice(),
                    group.name,
                    group.owner,
                    group.comment,
                    group.change_time.to_rfc3339(),
                    last_order + 1,
                    group.status.as_str(),
                    group.contains_backlogged,
                ],
            )
            .map_err(|e| map_constraint(e, &format!("change group {}", group.name)))?;
            group.group_id = ChangeGroupId::from_raw(tx.last_insert_rowid());
            group.execution_order = last_order + 1;

            let group_id = group.group_id;
            for action in group.actions.iter_mut() {
                insert_action(&tx, group_id, action)?;
            }
        }

        tx.commit()?;
        tracing::debug!(count = groups.len(), "created change groups");
        Ok(())
    }

    fn save_change_group(&mut self, group: &mut ChangeGroup) -> Result<(), StorageError> {
        if !group.group_id.is_persisted() {
            return Err(StorageError::Invariant(format!(
                "saving change group '{}' without a persisted id",
                group.name
            )));
        }
        let tx = self.write_tx()?;

        let changed = tx
            .execute(
                "UPDATE change_groups SET owner = ?1, comment = ?2, status = ?3, contains_backlogged = ?4 WHERE group_id = ?5",
                rusqlite::params![
                    group.owner,
                    group.comment,
                    group.status.as_str(),
                    group.contains_backlogged,
                    group.group_id.raw(),
                ],
            )
            .map_err(|e| map_constraint(e, &format!("change group {} already complete", group.name)))?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("change group {}", group.group_id)));
        }

        let group_id = group.group_id;
        for action in group.actions.iter_mut() {
            if !action.action_id.is_persisted() {
                insert_action(&tx, group_id, action)?;
                continue;
            }
            let changed = tx.execute(
                "UPDATE change_actions SET kind = ?1, path = ?2, from_path = ?3, content_type = ?4, item = ?5, version = ?6, translated_path = ?7, status = ?8, conflicted = ?9, fingerprint = ?10 WHERE action_id = ?11 AND group_id = ?12",
                rusqlite::params![
                    action.kind.as_str(),
                    action.path,
                    action.from_path,
                    action.content_type,
                    action.item,
                    action.version,
                    action.translated_path,
                    action.status.as_str(),
                    action.conflicted,
                    action.fingerprint().as_bytes().as_slice(),
                    action.action_id.raw(),
                    group_id.raw(),
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::Invariant(format!(
                    "action {} is not owned by change group {}",
                    action.action_id, group_id
                )));
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn load_change_group(&self, group_id: ChangeGroupId) -> Result<Option<ChangeGroup>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {GROUP_COLUMNS} FROM change_groups WHERE group_id = ?1"))?;
        let mut rows = stmt.query(rusqlite::params![group_id.raw()])?;
        match rows.next()? {
            Some(row) => {
                let mut group = read_group_header(row)?;
                group.actions = load_actions(&self.conn, group.group_id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    fn load_change_groups(&self, query: &GroupQuery, page: Page) -> Result<Vec<ChangeGroup>, StorageError> {
        let (clause, mut values) = Self::group_filter(query);
        values.push(Value::Integer(page.after));
        values.push(Value::Integer(page.limit as i64));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM change_groups WHERE {clause} AND execution_order > ? ORDER BY execution_order LIMIT ?"
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next()? {
            groups.push(read_group_header(row)?);
        }
        for group in groups.iter_mut() {
            group.actions = load_actions(&self.conn, group.group_id)?;
        }
        Ok(groups)
    }

    fn count_change_groups(&self, query: &GroupQuery) -> Result<u64, StorageError> {
        let (clause, values) = Self::group_filter(query);
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM change_groups WHERE {clause}"),
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn transition_groups(
        &mut self,
        session_id: SessionId,
        source_id: Option<SourceId>,
        from: ChangeStatus,
        to: ChangeStatus,
    ) -> Result<usize, StorageError> {
        if !from.can_transition_to(to) {
            return Err(StorageError::Invariant(format!(
                "bulk transition {} -> {} is not allowed",
                from.as_str(),
                to.as_str()
            )));
        }
        let tx = self.write_tx()?;
        let changed = match source_id {
            Some(source_id) => tx.execute(
                "UPDATE change_groups SET status = ?1 WHERE session_id = ?2 AND source_id = ?3 AND status = ?4",
                rusqlite::params![
                    to.as_str(),
                    session_id.as_bytes().as_slice(),
                    source_id.as_bytes().as_slice(),
                    from.as_str(),
                ],
            )?,
            None => tx.execute(
                "UPDATE change_groups SET status = ?1 WHERE session_id = ?2 AND status = ?3",
                rusqlite::params![to.as_str(), session_id.as_bytes().as_slice(), from.as_str()],
            )?,
        };
        tx.commit()?;
        tracing::debug!(
            session = %session_id,
            from = from.as_str(),
            to = to.as_str(),
            changed,
            "bulk group transition"
        );
        Ok(changed)
    }

    fn find_live_group_by_name(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<Option<ChangeGroupId>, StorageError> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT group_id FROM change_groups WHERE session_id = ?1 AND source_id = ?2 AND name = ?3 AND status != ?4 ORDER BY group_id LIMIT 1",
                rusqlite::params![
                    session_id.as_bytes().as_slice(),
                    source_id.as_bytes().as_slice(),
                    name,
                    ChangeStatus::Obsolete.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(ChangeGroupId::from_raw))
    }

    fn has_completed_group(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM change_groups WHERE session_id = ?1 AND source_id = ?2 AND name = ?3 AND status = ?4)",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                source_id.as_bytes().as_slice(),
                name,
                ChangeStatus::Complete.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn groups_touching_path(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        path: &str,
    ) -> Result<Vec<ChangeGroupId>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT g.group_id FROM change_groups g JOIN change_actions a ON a.group_id = g.group_id
             WHERE g.session_id = ?1 AND g.source_id = ?2
               AND g.status NOT IN ({terminal}, 'delta')
               AND a.status NOT IN ('skipped', 'complete')
               AND (a.path = ?3 OR a.from_path = ?3)
             ORDER BY g.group_id",
            terminal = terminal_statuses_sql()
        ))?;
        let ids = stmt
            .query_map(
                rusqlite::params![
                    session_id.as_bytes().as_slice(),
                    source_id.as_bytes().as_slice(),
                    path,
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(ChangeGroupId::from_raw).collect())
    }

    fn has_pending_create(&self, session_id: SessionId, path: &str) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM change_actions a JOIN change_groups g ON a.group_id = g.group_id
                 WHERE g.session_id = ?1 AND g.status NOT IN ({terminal})
                   AND a.kind IN ('add', 'branch', 'undelete')
                   AND a.status IN ('pending', 'backlogged')
                   AND a.path = ?2)",
                terminal = terminal_statuses_sql()
            ),
            rusqlite::params![session_id.as_bytes().as_slice(), path],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn is_path_backlogged(&self, session_id: SessionId, path: &str) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM change_actions a JOIN change_groups g ON a.group_id = g.group_id
                 WHERE g.session_id = ?1 AND g.status NOT IN ({terminal})
                   AND (a.status = 'backlogged' OR a.conflicted = 1)
                   AND a.path = ?2)
                 OR EXISTS(SELECT 1 FROM conflicts
                 WHERE session_id = ?1 AND status = 'unresolved' AND scope_hint = ?2 COLLATE NOCASE)",
                terminal = terminal_statuses_sql()
            ),
            rusqlite::params![session_id.as_bytes().as_slice(), path],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn group_status_counts(&self, session_id: SessionId) -> Result<Vec<(ChangeStatus, u64)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM change_groups WHERE session_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let mut rows = stmt.query(rusqlite::params![session_id.as_bytes().as_slice()])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.push((ChangeStatus::parse(&status)?, count as u64));
        }
        Ok(counts)
    }

    fn record_conversion(
        &mut self,
        session_id: SessionId,
        source_id: SourceId,
        source_change: &str,
        peer_source_id: SourceId,
        peer_change: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO conversion_history (session_id, source_id, source_change, peer_source_id, peer_change) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id, source_id, source_change) DO UPDATE SET peer_change = excluded.peer_change",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                source_id.as_bytes().as_slice(),
                source_change,
                peer_source_id.as_bytes().as_slice(),
                peer_change,
            ],
        )?;
        Ok(())
    }

    fn peer_change_id(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        source_change: &str,
    ) -> Result<Option<String>, StorageError> {
        let peer = self
            .conn
            .query_row(
                "SELECT peer_change FROM conversion_history WHERE session_id = ?1 AND source_id = ?2 AND source_change = ?3",
                rusqlite::params![
                    session_id.as_bytes().as_slice(),
                    source_id.as_bytes().as_slice(),
                    source_change,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(peer)
    }

    fn is_sync_generated(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        change_name: &str,
    ) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversion_history WHERE session_id = ?1 AND peer_source_id = ?2 AND peer_change = ?3)",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                source_id.as_bytes().as_slice(),
                change_name,
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_conflict(&mut self, conflict: &mut MigrationConflict) -> Result<(), StorageError> {
        if conflict.conflict_id.is_persisted() {
            return Err(StorageError::Invariant(format!(
                "conflict {} is already persisted",
                conflict.conflict_id
            )));
        }
        let outcome = conflict.outcome.as_ref().map(|o| o.to_msgpack()).transpose()?;
        self.conn.execute(
            "INSERT INTO conflicts (session_id, source_id, conflict_type, target_kind, target_id, group_id, scope_hint, details, fingerprint, status, resolved_by_rule, retry_count, created_at, resolved_by, outcome) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                conflict.session_id.as_bytes().as_slice(),
                conflict.source_id.as_bytes().as_slice(),
                conflict.conflict_type,
                conflict.target.kind_str(),
                conflict.target.raw_id(),
                conflict.group_id.map(|g| g.raw()),
                conflict.scope_hint,
                conflict.details,
                conflict.fingerprint.map(|f| f.as_bytes().to_vec()),
                conflict.status.as_str(),
                conflict.resolved_by_rule.map(|r| r.raw()),
                conflict.retry_count,
                conflict.created_at.to_rfc3339(),
                conflict.resolved_by.map(|r| r.as_str()),
                outcome,
            ],
        )?;
        conflict.conflict_id = ConflictId::from_raw(self.conn.last_insert_rowid());
        Ok(())
    }

    fn update_conflict(&mut self, conflict: &MigrationConflict) -> Result<(), StorageError> {
        if !conflict.conflict_id.is_persisted() {
            return Err(StorageError::Invariant(
                "updating a conflict without a persisted id".into(),
            ));
        }
        let outcome = conflict.outcome.as_ref().map(|o| o.to_msgpack()).transpose()?;
        let changed = self.conn.execute(
            "UPDATE conflicts SET scope_hint = ?1, details = ?2, fingerprint = ?3, status = ?4, resolved_by_rule = ?5, retry_count = ?6, resolved_by = ?7, outcome = ?8 WHERE conflict_id = ?9",
            rusqlite::params![
                conflict.scope_hint,
                conflict.details,
                conflict.fingerprint.map(|f| f.as_bytes().to_vec()),
                conflict.status.as_str(),
                conflict.resolved_by_rule.map(|r| r.raw()),
                conflict.retry_count,
                conflict.resolved_by.map(|r| r.as_str()),
                outcome,
                conflict.conflict_id.raw(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("conflict {}", conflict.conflict_id)));
        }
        Ok(())
    }

    fn get_conflict(&self, conflict_id: ConflictId) -> Result<Option<MigrationConflict>, StorageError> {
        Ok(self
            .query_conflicts("conflict_id = ?1", rusqlite::params![conflict_id.raw()])?
            .into_iter()
            .next())
    }

    fn conflicts_for_target(&self, target: ConflictTarget) -> Result<Vec<MigrationConflict>, StorageError> {
        self.query_conflicts(
            "target_kind = ?1 AND target_id = ?2",
            rusqlite::params![target.kind_str(), target.raw_id()],
        )
    }

    fn conflicts_with_status(
        &self,
        session_id: SessionId,
        status: ConflictStatus,
    ) -> Result<Vec<MigrationConflict>, StorageError> {
        self.query_conflicts(
            "session_id = ?1 AND status = ?2",
            rusqlite::params![session_id.as_bytes().as_slice(), status.as_str()],
        )
    }

    fn conflicts_for_group(&self, group_id: ChangeGroupId) -> Result<Vec<MigrationConflict>, StorageError> {
        self.query_conflicts("group_id = ?1", rusqlite::params![group_id.raw()])
    }

    fn has_resolved_conflict(
        &self,
        target: ConflictTarget,
        conflict_type: &str,
        fingerprint: Option<Fingerprint>,
    ) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conflicts WHERE target_kind = ?1 AND target_id = ?2 AND conflict_type = ?3 AND status = ?4 AND fingerprint IS ?5)",
            rusqlite::params![
                target.kind_str(),
                target.raw_id(),
                conflict_type,
                ConflictStatus::Resolved.as_str(),
                fingerprint.map(|f| f.as_bytes().to_vec()),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_rule(&mut self, rule: &mut ConflictResolutionRule) -> Result<(), StorageError> {
        if rule.rule_id.is_persisted() {
            return Err(StorageError::Invariant(format!("rule {} is already persisted", rule.rule_id)));
        }
        self.conn.execute(
            "INSERT INTO resolution_rules (session_id, conflict_type, scope, action, details, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                rule.session_id.as_bytes().as_slice(),
                rule.conflict_type,
                rule.scope,
                rule.action,
                rule.details,
                rule.data_to_msgpack()?,
                rule.created_at.to_rfc3339(),
            ],
        )?;
        rule.rule_id = RuleId::from_raw(self.conn.last_insert_rowid());
        Ok(())
    }

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<ConflictResolutionRule>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RULE_COLUMNS} FROM resolution_rules WHERE rule_id = ?1"))?;
        let mut rows = stmt.query(rusqlite::params![rule_id.raw()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_rule(row)?)),
            None => Ok(None),
        }
    }

    fn rules_for_type(
        &self,
        session_id: SessionId,
        conflict_type: &str,
    ) -> Result<Vec<ConflictResolutionRule>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM resolution_rules WHERE session_id = ?1 AND conflict_type = ?2 ORDER BY rule_id"
        ))?;
        let mut rows = stmt.query(rusqlite::params![session_id.as_bytes().as_slice(), conflict_type])?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next()? {
            rules.push(read_rule(row)?);
        }
        Ok(rules)
    }

    fn read_checkpoint(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM high_water_marks WHERE session_id = ?1 AND source_id = ?2 AND name = ?3",
                rusqlite::params![
                    session_id.as_bytes().as_slice(),
                    source_id.as_bytes().as_slice(),
                    name,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_checkpoint(
        &mut self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO high_water_marks (session_id, source_id, name, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, source_id, name) DO UPDATE SET value = excluded.value,
                 updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                source_id.as_bytes().as_slice(),
                name,
                value,
            ],
        )?;
        Ok(())
    }

    fn create_link_group(&mut self, group: &mut LinkChangeGroup) -> Result<(), StorageError> {
        if group.group_id.is_persisted() {
            return Err(StorageError::Invariant(format!(
                "link group {} is already persisted",
                group.group_id
            )));
        }
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO link_change_groups (session_id, source_id, name, status, contains_conflicted, age, retries_at_age, next_attempt_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                group.session_id.as_bytes().as_slice(),
                group.source_id.as_bytes().as_slice(),
                group.name,
                group.status.as_str(),
                group.contains_conflicted,
                group.age,
                group.retries_at_age,
                group.next_attempt_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        group.group_id = LinkGroupId::from_raw(tx.last_insert_rowid());
        let group_id = group.group_id;
        for action in group.actions.iter_mut() {
            insert_link_action(&tx, group_id, action)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_link_group(&mut self, group: &mut LinkChangeGroup) -> Result<(), StorageError> {
        if !group.group_id.is_persisted() {
            return Err(StorageError::Invariant(format!(
                "saving link group '{}' without a persisted id",
                group.name
            )));
        }
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE link_change_groups SET status = ?1, contains_conflicted = ?2, age = ?3, retries_at_age = ?4, next_attempt_at = ?5 WHERE group_id = ?6",
            rusqlite::params![
                group.status.as_str(),
                group.contains_conflicted,
                group.age,
                group.retries_at_age,
                group.next_attempt_at.map(|t| t.to_rfc3339()),
                group.group_id.raw(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("link group {}", group.group_id)));
        }
        let group_id = group.group_id;
        for action in group.actions.iter_mut() {
            if !action.action_id.is_persisted() {
                insert_link_action(&tx, group_id, action)?;
                continue;
            }
            let changed = tx.execute(
                "UPDATE link_change_actions SET status = ?1, conflicted = ?2, server_link_change_id = ?3 WHERE action_id = ?4 AND group_id = ?5",
                rusqlite::params![
                    action.status.as_str(),
                    action.conflicted,
                    action.server_link_change_id,
                    action.action_id.raw(),
                    group_id.raw(),
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::Invariant(format!(
                    "link action {} is not owned by link group {}",
                    action.action_id, group_id
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_link_group(&self, group_id: LinkGroupId) -> Result<Option<LinkChangeGroup>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_GROUP_COLUMNS} FROM link_change_groups WHERE group_id = ?1"
        ))?;
        let mut rows = stmt.query(rusqlite::params![group_id.raw()])?;
        match rows.next()? {
            Some(row) => {
                let mut group = read_link_group_header(row)?;
                group.actions = load_link_actions(&self.conn, group.group_id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    fn load_link_groups(
        &self,
        session_id: SessionId,
        statuses: &[LinkGroupStatus],
        page: Page,
    ) -> Result<Vec<LinkChangeGroup>, StorageError> {
        let mut values = vec![Value::Blob(session_id.as_bytes().to_vec())];
        let mut clause = String::from("session_id = ?");
        if !statuses.is_empty() {
            clause.push_str(&format!(" AND status IN ({})", placeholders(statuses.len())));
            values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        values.push(Value::Integer(page.after));
        values.push(Value::Integer(page.limit as i64));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_GROUP_COLUMNS} FROM link_change_groups WHERE {clause} AND group_id > ? ORDER BY group_id LIMIT ?"
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next()? {
            groups.push(read_link_group_header(row)?);
        }
        for group in groups.iter_mut() {
            group.actions = load_link_actions(&self.conn, group.group_id)?;
        }
        Ok(groups)
    }

    fn load_link_action(&self, action_id: LinkActionId) -> Result<Option<LinkChangeAction>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_ACTION_COLUMNS} FROM link_change_actions a WHERE a.action_id = ?1"
        ))?;
        let mut rows = stmt.query(rusqlite::params![action_id.raw()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_link_action(row)?)),
            None => Ok(None),
        }
    }

    fn find_link_actions(
        &self,
        session_id: SessionId,
        link: &ArtifactLink,
        kind: Option<LinkActionKind>,
        statuses: &[LinkActionStatus],
    ) -> Result<Vec<LinkChangeAction>, StorageError> {
        let mut clause = String::from(
            "g.session_id = ? AND a.source_uri = ? COLLATE NOCASE AND a.target_uri = ? COLLATE NOCASE AND a.link_type = ? COLLATE NOCASE",
        );
        let mut values = vec![
            Value::Blob(session_id.as_bytes().to_vec()),
            Value::Text(link.source_uri.clone()),
            Value::Text(link.target_uri.clone()),
            Value::Text(link.link_type.clone()),
        ];
        if let Some(kind) = kind {
            clause.push_str(" AND a.kind = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if !statuses.is_empty() {
            clause.push_str(&format!(" AND a.status IN ({})", placeholders(statuses.len())));
            values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_ACTION_COLUMNS} FROM link_change_actions a JOIN link_change_groups g ON a.group_id = g.group_id
             WHERE {clause} ORDER BY a.action_id"
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut actions = Vec::new();
        while let Some(row) = rows.next()? {
            actions.push(read_link_action(row)?);
        }
        Ok(actions)
    }

    fn update_link_action_status(
        &mut self,
        action_id: LinkActionId,
        status: LinkActionStatus,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE link_change_actions SET status = ?1 WHERE action_id = ?2",
            rusqlite::params![status.as_str(), action_id.raw()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("link action {action_id}")));
        }
        Ok(())
    }

    fn is_link_change_from_sync(
        &self,
        session_id: SessionId,
        server_change_id: &str,
    ) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM link_change_actions a JOIN link_change_groups g ON a.group_id = g.group_id
             WHERE g.session_id = ?1 AND a.server_link_change_id = ?2 AND a.status = ?3)",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                server_change_id,
                LinkActionStatus::Completed.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn link_group_status_counts(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<(LinkGroupStatus, u64)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM link_change_groups WHERE session_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let mut rows = stmt.query(rusqlite::params![session_id.as_bytes().as_slice()])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.push((LinkGroupStatus::parse(&status)?, count as u64));
        }
        Ok(counts)
    }
}
