//! The slice of business data the handlers touch: tracked entities, message
//! links, contacts and deadlines.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{parse_ts, to_ts, Database};
use crate::error::StoreError;
use crate::types::{Entity, EntityRef};

/// A message resolved to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLink {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub target: EntityRef,
    pub received_at: DateTime<Utc>,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: String,
    pub email: String,
    pub name: Option<String>,
    pub entity: Option<EntityRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub deadline_id: String,
    pub entity: EntityRef,
    pub due_date: NaiveDate,
    pub description: String,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EntityStore {
    db: Database,
}

impl EntityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn register(&self, entity: &Entity) -> Result<(), StoreError> {
        self.db.with_conn(|conn| upsert_entity(conn, entity))
    }

    pub fn get(&self, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
        self.db.with_conn(|conn| get_entity(conn, entity))
    }

    pub fn list(&self) -> Result<Vec<Entity>, StoreError> {
        self.db.with_conn(list_entities)
    }

    pub fn link_for(&self, message_id: &str) -> Result<Option<MessageLink>, StoreError> {
        self.db.with_conn(|conn| get_link(conn, message_id))
    }

    pub fn contact_by_email(&self, email: &str) -> Result<Option<Contact>, StoreError> {
        self.db.with_conn(|conn| contact_by_email(conn, email))
    }

    pub fn deadlines_for(&self, entity: &EntityRef) -> Result<Vec<Deadline>, StoreError> {
        self.db.with_conn(|conn| deadlines_for(conn, entity))
    }
}

pub(crate) fn upsert_entity(conn: &Connection, entity: &Entity) -> Result<(), StoreError> {
    let code = entity
        .code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_uppercase);
    conn.execute(
        "INSERT INTO entities (entity_type, entity_id, code, name, status)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (entity_type, entity_id)
         DO UPDATE SET code = excluded.code, name = excluded.name, status = excluded.status",
        params![
            entity.entity.entity_type.as_str(),
            entity.entity.entity_id,
            code,
            entity.name,
            entity.status,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_entity(conn: &Connection, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT entity_type, entity_id, code, name, status FROM entities
             WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity.entity_type.as_str(), entity.entity_id],
            raw_entity,
        )
        .optional()?;
    raw.map(into_entity).transpose()
}

/// Entity whose structured code equals `code` (case-insensitive).
pub(crate) fn find_by_code(conn: &Connection, code: &str) -> Result<Option<Entity>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT entity_type, entity_id, code, name, status FROM entities WHERE code = ?1",
            params![code.trim().to_uppercase()],
            raw_entity,
        )
        .optional()?;
    raw.map(into_entity).transpose()
}

pub(crate) fn list_entities(conn: &Connection) -> Result<Vec<Entity>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, code, name, status FROM entities ORDER BY entity_type, entity_id",
    )?;
    let rows = stmt.query_map([], raw_entity)?.collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_entity).collect()
}

pub(crate) fn set_entity_status(
    conn: &Connection,
    entity: &EntityRef,
    status: &str,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE entities SET status = ?1 WHERE entity_type = ?2 AND entity_id = ?3",
        params![status, entity.entity_type.as_str(), entity.entity_id],
    )?;
    Ok(changed == 1)
}

type RawEntity = (String, String, Option<String>, String, String);

fn raw_entity(row: &Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_entity(raw: RawEntity) -> Result<Entity, StoreError> {
    let (entity_type, entity_id, code, name, status) = raw;
    Ok(Entity {
        entity: EntityRef::new(entity_type.parse()?, entity_id),
        code,
        name,
        status,
    })
}

pub(crate) fn get_link(conn: &Connection, message_id: &str) -> Result<Option<MessageLink>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT message_id, thread_id, entity_type, entity_id, received_at, linked_at
             FROM message_links WHERE message_id = ?1",
            params![message_id],
            raw_link,
        )
        .optional()?;
    raw.map(into_link).transpose()
}

pub(crate) fn put_link(conn: &Connection, link: &MessageLink) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO message_links (message_id, thread_id, entity_type, entity_id, received_at, linked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (message_id) DO UPDATE SET
            thread_id = excluded.thread_id, entity_type = excluded.entity_type,
            entity_id = excluded.entity_id, received_at = excluded.received_at,
            linked_at = excluded.linked_at",
        params![
            link.message_id,
            link.thread_id,
            link.target.entity_type.as_str(),
            link.target.entity_id,
            to_ts(&link.received_at),
            to_ts(&link.linked_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_link(conn: &Connection, message_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM message_links WHERE message_id = ?1",
        params![message_id],
    )?;
    Ok(())
}

/// Most recently received link in `thread_id`, ignoring `exclude_message`.
pub(crate) fn latest_thread_link(
    conn: &Connection,
    thread_id: &str,
    exclude_message: &str,
) -> Result<Option<MessageLink>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT message_id, thread_id, entity_type, entity_id, received_at, linked_at
             FROM message_links
             WHERE thread_id = ?1 AND message_id != ?2
             ORDER BY received_at DESC, linked_at DESC
             LIMIT 1",
            params![thread_id, exclude_message],
            raw_link,
        )
        .optional()?;
    raw.map(into_link).transpose()
}

/// A link in `thread_id` for a message received after `after`.
pub(crate) fn newer_thread_link(
    conn: &Connection,
    thread_id: &str,
    after: &DateTime<Utc>,
    exclude_message: &str,
) -> Result<Option<MessageLink>, StoreError> {
    let latest = latest_thread_link(conn, thread_id, exclude_message)?;
    Ok(latest.filter(|link| link.received_at > *after))
}

type RawLink = (String, Option<String>, String, String, String, String);

fn raw_link(row: &Row<'_>) -> rusqlite::Result<RawLink> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_link(raw: RawLink) -> Result<MessageLink, StoreError> {
    let (message_id, thread_id, entity_type, entity_id, received_at, linked_at) = raw;
    Ok(MessageLink {
        message_id,
        thread_id,
        target: EntityRef::new(entity_type.parse()?, entity_id),
        received_at: parse_ts(&received_at)?,
        linked_at: parse_ts(&linked_at)?,
    })
}

pub(crate) fn insert_contact(conn: &Connection, contact: &Contact) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO contacts (contact_id, email, name, entity_type, entity_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            contact.contact_id,
            contact.email.trim().to_lowercase(),
            contact.name,
            contact.entity.as_ref().map(|e| e.entity_type.as_str()),
            contact.entity.as_ref().map(|e| e.entity_id.as_str()),
            to_ts(&contact.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn contact_by_email(conn: &Connection, email: &str) -> Result<Option<Contact>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT contact_id, email, name, entity_type, entity_id, created_at
             FROM contacts WHERE email = ?1",
            params![email.trim().to_lowercase()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((contact_id, email, name, entity_type, entity_id, created_at)) = raw else {
        return Ok(None);
    };
    let entity = match (entity_type, entity_id) {
        (Some(kind), Some(id)) => Some(EntityRef::new(kind.parse()?, id)),
        _ => None,
    };
    Ok(Some(Contact {
        contact_id,
        email,
        name,
        entity,
        created_at: parse_ts(&created_at)?,
    }))
}

pub(crate) fn delete_contact(conn: &Connection, contact_id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "DELETE FROM contacts WHERE contact_id = ?1",
        params![contact_id],
    )?;
    Ok(changed == 1)
}

pub(crate) fn insert_deadline(conn: &Connection, deadline: &Deadline) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO deadlines (deadline_id, entity_type, entity_id, due_date, description, source_message_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            deadline.deadline_id,
            deadline.entity.entity_type.as_str(),
            deadline.entity.entity_id,
            deadline.due_date.to_string(),
            deadline.description,
            deadline.source_message_id,
            to_ts(&deadline.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn deadlines_for(conn: &Connection, entity: &EntityRef) -> Result<Vec<Deadline>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT deadline_id, due_date, description, source_message_id, created_at
         FROM deadlines WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY due_date, deadline_id",
    )?;
    let rows = stmt
        .query_map(params![entity.entity_type.as_str(), entity.entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(deadline_id, due_date, description, source_message_id, created_at)| {
            let due_date = due_date
                .parse::<NaiveDate>()
                .map_err(|e| StoreError::InvalidRow(format!("bad due date '{due_date}': {e}")))?;
            Ok(Deadline {
                deadline_id,
                entity: entity.clone(),
                due_date,
                description,
                source_message_id,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
}

pub(crate) fn delete_deadline(conn: &Connection, deadline_id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "DELETE FROM deadlines WHERE deadline_id = ?1",
        params![deadline_id],
    )?;
    Ok(changed == 1)
}
