use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            email           TEXT NOT NULL UNIQUE,
            username        TEXT NOT NULL UNIQUE,
            hash            TEXT NOT NULL,
            client_salt     TEXT NOT NULL,
            keygen_salt     TEXT NOT NULL,
            server_salt     TEXT NOT NULL,
            pw_public_key   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS devices (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            name        TEXT,
            public_key  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_devices_user
            ON devices(user_id);

        CREATE TABLE IF NOT EXISTS auth_tokens (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            token       TEXT NOT NULL UNIQUE,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            expiration  INTEGER NOT NULL,
            public_key  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keypair_records (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            id_token            TEXT NOT NULL UNIQUE,
            server_public_key   TEXT NOT NULL,
            server_secret_key   TEXT NOT NULL,
            client_public_key   TEXT NOT NULL,
            expiration          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            default_name    TEXT NOT NULL,
            time_created    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memberships (
            user_id         INTEGER NOT NULL REFERENCES users(id),
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            custom_name     TEXT,
            UNIQUE(user_id, conversation_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_conversation
            ON memberships(conversation_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            senttime        INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, senttime);

        -- A digest is addressed to exactly one identity: user xor device.
        CREATE TABLE IF NOT EXISTS digests (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            contents    TEXT NOT NULL,
            user_id     INTEGER REFERENCES users(id),
            device_id   INTEGER REFERENCES devices(id),
            CHECK ((user_id IS NULL) <> (device_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_digests_message
            ON digests(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
