//! Database schema migrations.
//!
//! Version 1 creates the characters, facts and relations tables, their tag
//! and alias side tables, and trigram FTS5 indexes over the searchable text.

use rusqlite::Connection;
use tracing::info;

use lore_core::error::{LoreError, Result};

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| LoreError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| LoreError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
///
/// `seq` is the stable integer rowid the FTS5 external-content tables point at;
/// `id` is the public UUID.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS characters (
            seq             INTEGER PRIMARY KEY,
            id              TEXT NOT NULL UNIQUE,
            name            TEXT NOT NULL CHECK (length(trim(name)) > 0),
            name_key        TEXT NOT NULL,
            aliases         TEXT NOT NULL DEFAULT '[]',
            tags            TEXT NOT NULL DEFAULT '[]',
            description     TEXT NOT NULL DEFAULT '',
            embedding       BLOB,
            embedding_dim   INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_characters_name_key
            ON characters (name_key);

        CREATE TABLE IF NOT EXISTS character_aliases (
            character_id    TEXT NOT NULL,
            alias_key       TEXT NOT NULL,
            PRIMARY KEY (character_id, alias_key),
            FOREIGN KEY (character_id) REFERENCES characters(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_character_aliases_key
            ON character_aliases (alias_key);

        CREATE TABLE IF NOT EXISTS character_tags (
            character_id    TEXT NOT NULL,
            tag_key         TEXT NOT NULL,
            PRIMARY KEY (character_id, tag_key),
            FOREIGN KEY (character_id) REFERENCES characters(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_character_tags_key
            ON character_tags (tag_key);

        CREATE TABLE IF NOT EXISTS facts (
            seq             INTEGER PRIMARY KEY,
            id              TEXT NOT NULL UNIQUE,
            character_id    TEXT NOT NULL,
            fact_type       TEXT NOT NULL CHECK (length(trim(fact_type)) > 0),
            fact_type_key   TEXT NOT NULL,
            content         TEXT NOT NULL CHECK (length(trim(content)) > 0),
            source          TEXT,
            tags            TEXT NOT NULL DEFAULT '[]',
            embedding       BLOB,
            embedding_dim   INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            FOREIGN KEY (character_id) REFERENCES characters(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_facts_character
            ON facts (character_id, updated_at DESC);

        CREATE INDEX IF NOT EXISTS idx_facts_type
            ON facts (fact_type_key);

        CREATE TABLE IF NOT EXISTS fact_tags (
            fact_id         TEXT NOT NULL,
            tag_key         TEXT NOT NULL,
            PRIMARY KEY (fact_id, tag_key),
            FOREIGN KEY (fact_id) REFERENCES facts(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_fact_tags_key
            ON fact_tags (tag_key);

        CREATE TABLE IF NOT EXISTS relations (
            id              TEXT PRIMARY KEY NOT NULL,
            source_id       TEXT NOT NULL,
            target_id       TEXT NOT NULL,
            relation_type   TEXT NOT NULL CHECK (length(trim(relation_type)) > 0),
            description     TEXT NOT NULL DEFAULT '',
            strength        REAL NOT NULL DEFAULT 0.5
                            CHECK (strength >= 0.0 AND strength <= 1.0),
            embedding       BLOB,
            embedding_dim   INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            CHECK (source_id <> target_id),
            UNIQUE (source_id, target_id, relation_type),
            FOREIGN KEY (source_id) REFERENCES characters(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES characters(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_relations_source
            ON relations (source_id);

        CREATE INDEX IF NOT EXISTS idx_relations_target
            ON relations (target_id);

        -- Trigram indexes for fuzzy lexical matching.
        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
            content,
            content='facts',
            content_rowid='seq',
            tokenize='trigram'
        );

        CREATE TRIGGER IF NOT EXISTS facts_fts_insert AFTER INSERT ON facts BEGIN
            INSERT INTO facts_fts(rowid, content) VALUES (new.seq, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_fts_delete AFTER DELETE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
                VALUES ('delete', old.seq, old.content);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_fts_update AFTER UPDATE OF content ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
                VALUES ('delete', old.seq, old.content);
            INSERT INTO facts_fts(rowid, content) VALUES (new.seq, new.content);
        END;

        CREATE VIRTUAL TABLE IF NOT EXISTS characters_fts USING fts5(
            name,
            aliases,
            description,
            content='characters',
            content_rowid='seq',
            tokenize='trigram'
        );

        CREATE TRIGGER IF NOT EXISTS characters_fts_insert AFTER INSERT ON characters BEGIN
            INSERT INTO characters_fts(rowid, name, aliases, description)
                VALUES (new.seq, new.name, new.aliases, new.description);
        END;

        CREATE TRIGGER IF NOT EXISTS characters_fts_delete AFTER DELETE ON characters BEGIN
            INSERT INTO characters_fts(characters_fts, rowid, name, aliases, description)
                VALUES ('delete', old.seq, old.name, old.aliases, old.description);
        END;

        CREATE TRIGGER IF NOT EXISTS characters_fts_update
            AFTER UPDATE OF name, aliases, description ON characters BEGIN
            INSERT INTO characters_fts(characters_fts, rowid, name, aliases, description)
                VALUES ('delete', old.seq, old.name, old.aliases, old.description);
            INSERT INTO characters_fts(rowid, name, aliases, description)
                VALUES (new.seq, new.name, new.aliases, new.description);
        END;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| LoreError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn insert_character(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO characters (id, name, name_key, created_at, updated_at)
             VALUES (?1, ?1, ?1, 0, 0)",
            [id],
        )
        .unwrap();
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_self_relation_rejected_by_schema() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_character(&conn, "a");

        let result = conn.execute(
            "INSERT INTO relations (id, source_id, target_id, relation_type, created_at, updated_at)
             VALUES ('r', 'a', 'a', 'self', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cascade_removes_dependents() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_character(&conn, "a");
        insert_character(&conn, "b");
        conn.execute_batch(
            "INSERT INTO facts (id, character_id, fact_type, fact_type_key, content, created_at, updated_at)
                 VALUES ('f1', 'a', 'skill', 'skill', 'Archery', 0, 0);
             INSERT INTO fact_tags (fact_id, tag_key) VALUES ('f1', 'bow');
             INSERT INTO relations (id, source_id, target_id, relation_type, created_at, updated_at)
                 VALUES ('r1', 'b', 'a', 'rival', 0, 0);",
        )
        .unwrap();

        conn.execute("DELETE FROM characters WHERE id = 'a'", []).unwrap();

        for table in ["facts", "fact_tags", "relations"] {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0, "orphans left in {}", table);
        }
        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM facts_fts WHERE facts_fts MATCH '\"Archery\"'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts, 0);
    }

    #[test]
    fn test_trigram_fts_matches_cjk_substring() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_character(&conn, "a");
        conn.execute(
            "INSERT INTO facts (id, character_id, fact_type, fact_type_key, content, created_at, updated_at)
             VALUES ('f1', 'a', '性格', '性格', '李青在面对危险时总是保持冷静', 0, 0)",
            [],
        )
        .unwrap();

        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM facts_fts WHERE facts_fts MATCH '\"保持冷\"'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }
}
