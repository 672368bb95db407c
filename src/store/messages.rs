//! Record of every ingested message, kept for review and supersession checks.

use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_ts, to_ts};
use crate::error::StoreError;
use crate::message::{Direction, NormalizedMessage};

pub(crate) fn record(conn: &Connection, message: &NormalizedMessage) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO messages
            (message_id, sender, sender_domain, sender_name, subject, body_excerpt, thread_id, direction, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.message_id,
            message.sender,
            message.sender_domain,
            message.sender_name,
            message.subject,
            message.body_excerpt,
            message.thread_id,
            message.direction.as_str(),
            to_ts(&message.received_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn get(conn: &Connection, message_id: &str) -> Result<Option<NormalizedMessage>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT message_id, sender, sender_domain, sender_name, subject, body_excerpt,
                    thread_id, direction, received_at
             FROM messages WHERE message_id = ?1",
            params![message_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((message_id, sender, sender_domain, sender_name, subject, body_excerpt, thread_id, direction, received_at)) =
        raw
    else {
        return Ok(None);
    };

    let direction = match direction.as_str() {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        other => {
            return Err(StoreError::InvalidRow(format!("unknown direction '{other}'")));
        }
    };

    let mut message = NormalizedMessage {
        message_id,
        sender,
        sender_domain,
        sender_name,
        subject,
        body_excerpt,
        thread_id,
        direction,
        received_at: parse_ts(&received_at)?,
        searchable_text: String::new(),
    };
    message.rebuild_searchable_text();
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::store::Database;

    #[test]
    fn test_record_and_reload() {
        let db = Database::open_in_memory().unwrap();
        let message = Message::new("m1", "a@client.com")
            .with_subject("Harbor Bridge")
            .with_thread("t1")
            .normalize()
            .unwrap();

        let loaded = db
            .with_conn(|conn| {
                record(conn, &message)?;
                record(conn, &message)?;
                get(conn, "m1")
            })
            .unwrap()
            .unwrap();

        assert_eq!(loaded.sender_domain, "client.com");
        assert_eq!(loaded.thread_id.as_deref(), Some("t1"));
        assert!(loaded.searchable_text.contains("harbor bridge"));
    }
}
