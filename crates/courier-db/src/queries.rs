use anyhow::Result;
use rusqlite::Connection;

use courier_types::models::{DigestRecipient, PreparedDigest, Roster};

use crate::models::{
    AuthTokenRow, ConversationEntryRow, DigestViewRow, KeyPairRecordRow, MembershipRow, NewUser,
    UserRow,
};
use crate::Database;

/// Result of an insert whose uniqueness is enforced by the store itself.
/// Callers retry on `Conflict` with fresh material instead of pre-checking
/// existence — the store is the only arbiter, so there is no race window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Conflict,
}

fn insert_or_conflict(result: rusqlite::Result<usize>, conn: &Connection) -> Result<InsertOutcome> {
    match result {
        Ok(_) => Ok(InsertOutcome::Inserted(conn.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(InsertOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

impl Database {
    // -- Users --

    pub fn insert_user(&self, user: &NewUser<'_>) -> Result<InsertOutcome> {
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO users (email, username, hash, client_salt, keygen_salt, server_salt, pw_public_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    user.email,
                    user.username,
                    user.hash,
                    user.client_salt,
                    user.keygen_salt,
                    user.server_salt,
                    user.pw_public_key,
                ],
            );
            insert_or_conflict(result, conn)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, email, username, hash, client_salt, keygen_salt, server_salt, pw_public_key
                 FROM users WHERE id = ?1",
            )?;
            stmt.query_row([id], map_user_row).optional()
        })
    }

    pub fn get_user_id_by_email(&self, email: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT id FROM users WHERE email = ?1", [email], |row| row.get(0))
                .optional()
        })
    }

    // -- Devices --

    pub fn insert_device(&self, user_id: i64, name: Option<&str>, public_key: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (user_id, name, public_key) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, name, public_key],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_device_by_user_and_key(&self, user_id: i64, public_key: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM devices WHERE user_id = ?1 AND public_key = ?2",
                rusqlite::params![user_id, public_key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // -- Auth tokens --

    pub fn insert_auth_token(
        &self,
        token: &str,
        user_id: i64,
        expiration: i64,
        public_key: &str,
    ) -> Result<InsertOutcome> {
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO auth_tokens (token, user_id, expiration, public_key) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![token, user_id, expiration, public_key],
            );
            insert_or_conflict(result, conn)
        })
    }

    pub fn get_auth_token(&self, token: &str) -> Result<Option<AuthTokenRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT token, user_id, expiration, public_key FROM auth_tokens WHERE token = ?1",
            )?;
            stmt.query_row([token], |row| {
                Ok(AuthTokenRow {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expiration: row.get(2)?,
                    public_key: row.get(3)?,
                })
            })
            .optional()
        })
    }

    pub fn update_auth_token_expiration(&self, token: &str, expiration: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE auth_tokens SET expiration = ?1 WHERE token = ?2",
                rusqlite::params![expiration, token],
            )?;
            Ok(())
        })
    }

    pub fn delete_expired_auth_tokens(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM auth_tokens WHERE expiration < ?1", [now])?)
        })
    }

    // -- Ephemeral key-pair records --

    pub fn insert_key_pair_record(&self, record: &KeyPairRecordRow) -> Result<InsertOutcome> {
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO keypair_records
                     (id_token, server_public_key, server_secret_key, client_public_key, expiration)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.id_token,
                    record.server_public_key,
                    record.server_secret_key,
                    record.client_public_key,
                    record.expiration,
                ],
            );
            insert_or_conflict(result, conn)
        })
    }

    pub fn get_key_pair_record(&self, id_token: &str) -> Result<Option<KeyPairRecordRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id_token, server_public_key, server_secret_key, client_public_key, expiration
                 FROM keypair_records WHERE id_token = ?1",
            )?;
            stmt.query_row([id_token], |row| {
                Ok(KeyPairRecordRow {
                    id_token: row.get(0)?,
                    server_public_key: row.get(1)?,
                    server_secret_key: row.get(2)?,
                    client_public_key: row.get(3)?,
                    expiration: row.get(4)?,
                })
            })
            .optional()
        })
    }

    pub fn delete_expired_key_pair_records(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM keypair_records WHERE expiration < ?1", [now])?)
        })
    }

    // -- Conversations & membership --

    /// Insert a conversation plus one membership row per participant in a
    /// single transaction. `members` pairs each user id with that member's
    /// custom display name, if any (in practice only the creator's).
    pub fn insert_conversation_with_members(
        &self,
        default_name: &str,
        time_created: i64,
        members: &[(i64, Option<&str>)],
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (default_name, time_created) VALUES (?1, ?2)",
                rusqlite::params![default_name, time_created],
            )?;
            let conversation_id = tx.last_insert_rowid();

            for (user_id, custom_name) in members {
                // OR IGNORE keeps the one-row-per-(user, conversation)
                // invariant even if the same user appears twice.
                tx.execute(
                    "INSERT OR IGNORE INTO memberships (user_id, conversation_id, custom_name)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![user_id, conversation_id, custom_name],
                )?;
            }

            tx.commit()?;
            Ok(conversation_id)
        })
    }

    pub fn get_membership(&self, user_id: i64, conversation_id: i64) -> Result<Option<MembershipRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, conversation_id, custom_name FROM memberships
                 WHERE user_id = ?1 AND conversation_id = ?2",
            )?;
            stmt.query_row(rusqlite::params![user_id, conversation_id], |row| {
                Ok(MembershipRow {
                    user_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    custom_name: row.get(2)?,
                })
            })
            .optional()
        })
    }

    pub fn list_conversations_for_user(&self, user_id: i64) -> Result<Vec<ConversationEntryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.default_name, m.custom_name
                 FROM memberships m
                 LEFT JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.user_id = ?1
                 ORDER BY c.time_created DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationEntryRow {
                        conversation_id: row.get(0)?,
                        default_name: row.get(1)?,
                        custom_name: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Current roster: member user ids plus all of those members' device ids.
    pub fn get_roster(&self, conversation_id: i64) -> Result<Roster> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM memberships WHERE conversation_id = ?1")?;
            let user_ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT d.id FROM devices d
                 JOIN memberships m ON m.user_id = d.user_id
                 WHERE m.conversation_id = ?1",
            )?;
            let device_ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;

            Ok(Roster { user_ids, device_ids })
        })
    }

    pub fn list_member_user_keys(&self, conversation_id: i64) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.pw_public_key FROM memberships m
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.conversation_id = ?1",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_member_device_keys(&self, conversation_id: i64) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.id, d.public_key FROM devices d
                 JOIN memberships m ON m.user_id = d.user_id
                 WHERE m.conversation_id = ?1",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages & digests --

    /// Insert the message row and every digest row in one transaction —
    /// a failure partway leaves nothing behind.
    pub fn insert_message_with_digests(
        &self,
        conversation_id: i64,
        sender_id: i64,
        senttime: i64,
        digests: &[PreparedDigest],
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, senttime) VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation_id, sender_id, senttime],
            )?;
            let message_id = tx.last_insert_rowid();

            for digest in digests {
                let (user_id, device_id) = match digest.recipient {
                    DigestRecipient::User(id) => (Some(id), None),
                    DigestRecipient::Device(id) => (None, Some(id)),
                };
                tx.execute(
                    "INSERT INTO digests (message_id, contents, user_id, device_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![message_id, digest.contents, user_id, device_id],
                )?;
            }

            tx.commit()?;
            Ok(message_id)
        })
    }

    /// All digests addressed to one identity in one conversation, joined
    /// with the sending username, newest first.
    pub fn list_digests_for_conversation(
        &self,
        conversation_id: i64,
        recipient: DigestRecipient,
    ) -> Result<Vec<DigestViewRow>> {
        self.with_conn(|conn| {
            let (clause, id) = recipient_clause(recipient);
            let sql = format!(
                "SELECT u.username, d.contents, m.senttime
                 FROM digests d
                 LEFT JOIN messages m ON m.id = d.message_id
                 LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.conversation_id = ?1 AND {clause}
                 ORDER BY m.senttime DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, id], |row| {
                    Ok(DigestViewRow {
                        sender_username: row.get(0)?,
                        contents: row.get(1)?,
                        senttime: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Most recent digest addressed to one identity in one conversation.
    pub fn last_digest_for_conversation(
        &self,
        conversation_id: i64,
        recipient: DigestRecipient,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let (clause, id) = recipient_clause(recipient);
            let sql = format!(
                "SELECT d.contents FROM digests d
                 LEFT JOIN messages m ON m.id = d.message_id
                 WHERE m.conversation_id = ?1 AND {clause}
                 ORDER BY m.senttime DESC LIMIT 1"
            );
            conn.query_row(&sql, rusqlite::params![conversation_id, id], |row| row.get(0))
                .optional()
        })
    }
}

fn recipient_clause(recipient: DigestRecipient) -> (&'static str, i64) {
    match recipient {
        DigestRecipient::User(id) => ("d.user_id = ?2", id),
        DigestRecipient::Device(id) => ("d.device_id = ?2", id),
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, email, username, hash, client_salt, keygen_salt, server_salt, pw_public_key
         FROM users WHERE {column} = ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([value], map_user_row).optional()
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        hash: row.get(3)?,
        client_salt: row.get(4)?,
        keygen_salt: row.get(5)?,
        server_salt: row.get(6)?,
        pw_public_key: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_user(db: &Database, username: &str) -> i64 {
        let email = format!("{username}@example.com");
        let hash = "ab".repeat(32);
        let pw_public_key = "cd".repeat(32);
        let user = NewUser {
            email: &email,
            username,
            hash: &hash,
            client_salt: "saltcli",
            keygen_salt: "saltkey",
            server_salt: "saltsrv",
            pw_public_key: &pw_public_key,
        };
        match db.insert_user(&user).unwrap() {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Conflict => panic!("seed user conflicted"),
        }
    }

    #[test]
    fn user_roundtrip_and_uniqueness() {
        let db = Database::open_in_memory().unwrap();
        let id = seed_user(&db, "alice");

        let row = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.email, "alice@example.com");
        assert!(db.get_user_by_username("bob").unwrap().is_none());

        // same username again is a conflict, not an error
        let dup = NewUser {
            email: "other@example.com",
            username: "alice",
            hash: "00",
            client_salt: "a",
            keygen_salt: "b",
            server_salt: "c",
            pw_public_key: "dd",
        };
        assert_eq!(db.insert_user(&dup).unwrap(), InsertOutcome::Conflict);
    }

    #[test]
    fn auth_token_conflict_and_expiry_sweep() {
        let db = Database::open_in_memory().unwrap();
        let user = seed_user(&db, "alice");

        let outcome = db.insert_auth_token("tok-1", user, 1_000, "aa").unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        assert_eq!(
            db.insert_auth_token("tok-1", user, 2_000, "aa").unwrap(),
            InsertOutcome::Conflict
        );

        db.update_auth_token_expiration("tok-1", 5_000).unwrap();
        let row = db.get_auth_token("tok-1").unwrap().unwrap();
        assert_eq!(row.expiration, 5_000);
        assert_eq!(row.user_id, user);

        assert_eq!(db.delete_expired_auth_tokens(4_999).unwrap(), 0);
        assert_eq!(db.delete_expired_auth_tokens(5_001).unwrap(), 1);
        assert!(db.get_auth_token("tok-1").unwrap().is_none());
    }

    #[test]
    fn key_pair_record_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let record = KeyPairRecordRow {
            id_token: "id-1".into(),
            server_public_key: "aa".repeat(32),
            server_secret_key: "bb".repeat(32),
            client_public_key: "cc".repeat(32),
            expiration: 9_000,
        };
        assert!(matches!(
            db.insert_key_pair_record(&record).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(db.insert_key_pair_record(&record).unwrap(), InsertOutcome::Conflict);

        let row = db.get_key_pair_record("id-1").unwrap().unwrap();
        assert_eq!(row.server_secret_key, "bb".repeat(32));

        assert_eq!(db.delete_expired_key_pair_records(10_000).unwrap(), 1);
        assert!(db.get_key_pair_record("id-1").unwrap().is_none());
    }

    #[test]
    fn conversation_membership_is_unique_per_pair() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        // alice listed twice collapses to one membership row
        let convo = db
            .insert_conversation_with_members(
                "alice bob",
                100,
                &[(alice, Some("pals")), (bob, None), (alice, None)],
            )
            .unwrap();

        let roster = db.get_roster(convo).unwrap();
        let mut users = roster.user_ids.clone();
        users.sort();
        assert_eq!(users, vec![alice, bob]);

        let membership = db.get_membership(alice, convo).unwrap().unwrap();
        assert_eq!(membership.custom_name.as_deref(), Some("pals"));
        assert!(db.get_membership(alice, convo + 1).unwrap().is_none());
    }

    #[test]
    fn conversation_listing_prefers_custom_name() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        db.insert_conversation_with_members("alice bob", 100, &[(alice, Some("work")), (bob, None)])
            .unwrap();

        let for_alice = db.list_conversations_for_user(alice).unwrap();
        assert_eq!(for_alice.len(), 1);
        assert_eq!(for_alice[0].custom_name.as_deref(), Some("work"));

        let for_bob = db.list_conversations_for_user(bob).unwrap();
        assert_eq!(for_bob[0].custom_name, None);
        assert_eq!(for_bob[0].default_name, "alice bob");
    }

    #[test]
    fn roster_includes_member_devices() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");
        let alice_phone = db.insert_device(alice, Some("phone"), &"ee".repeat(32)).unwrap();
        let carol_tablet = db.insert_device(carol, None, &"ff".repeat(32)).unwrap();
        let _ = carol_tablet;

        let convo = db
            .insert_conversation_with_members("c", 1, &[(alice, None), (bob, None)])
            .unwrap();

        let roster = db.get_roster(convo).unwrap();
        assert_eq!(roster.device_ids, vec![alice_phone]); // carol is not a member

        let device_keys = db.list_member_device_keys(convo).unwrap();
        assert_eq!(device_keys, vec![(alice_phone, "ee".repeat(32))]);
        let user_keys = db.list_member_user_keys(convo).unwrap();
        assert_eq!(user_keys.len(), 2);
    }

    #[test]
    fn message_with_digests_is_atomic_and_addressed() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let bob_phone = db.insert_device(bob, Some("phone"), &"ee".repeat(32)).unwrap();
        let convo = db
            .insert_conversation_with_members("c", 1, &[(alice, None), (bob, None)])
            .unwrap();

        let digests = vec![
            PreparedDigest { recipient: DigestRecipient::User(alice), contents: "a1".into() },
            PreparedDigest { recipient: DigestRecipient::User(bob), contents: "b1".into() },
            PreparedDigest { recipient: DigestRecipient::Device(bob_phone), contents: "d1".into() },
        ];
        db.insert_message_with_digests(convo, alice, 500, &digests).unwrap();

        // user- and device-addressed streams are disjoint
        let bob_view = db
            .list_digests_for_conversation(convo, DigestRecipient::User(bob))
            .unwrap();
        assert_eq!(bob_view.len(), 1);
        assert_eq!(bob_view[0].contents, "b1");
        assert_eq!(bob_view[0].sender_username, "alice");

        let phone_view = db
            .list_digests_for_conversation(convo, DigestRecipient::Device(bob_phone))
            .unwrap();
        assert_eq!(phone_view.len(), 1);
        assert_eq!(phone_view[0].contents, "d1");

        let digests2 = vec![
            PreparedDigest { recipient: DigestRecipient::User(alice), contents: "a2".into() },
            PreparedDigest { recipient: DigestRecipient::User(bob), contents: "b2".into() },
            PreparedDigest { recipient: DigestRecipient::Device(bob_phone), contents: "d2".into() },
        ];
        db.insert_message_with_digests(convo, bob, 900, &digests2).unwrap();

        assert_eq!(
            db.last_digest_for_conversation(convo, DigestRecipient::User(alice)).unwrap(),
            Some("a2".into())
        );
        assert_eq!(
            db.last_digest_for_conversation(convo, DigestRecipient::Device(bob_phone)).unwrap(),
            Some("d2".into())
        );
        assert_eq!(
            db.last_digest_for_conversation(convo + 1, DigestRecipient::User(alice)).unwrap(),
            None
        );
    }

    #[test]
    fn digest_recipient_exclusivity_is_enforced_by_schema() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");
        let convo = db
            .insert_conversation_with_members("c", 1, &[(alice, None)])
            .unwrap();
        let msg = db
            .insert_message_with_digests(convo, alice, 1, &[PreparedDigest {
                recipient: DigestRecipient::User(alice),
                contents: "aa".into(),
            }])
            .unwrap();

        // both identities set
        let both = db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO digests (message_id, contents, user_id, device_id) VALUES (?1, 'x', ?2, 1)",
                rusqlite::params![msg, alice],
            ))
        });
        assert!(both.unwrap().is_err());

        // neither identity set
        let neither = db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO digests (message_id, contents) VALUES (?1, 'x')",
                rusqlite::params![msg],
            ))
        });
        assert!(neither.unwrap().is_err());
    }
}
