/// Schema applied by [`super::Database::execute_init`]. Every statement is idempotent.
pub const SCHEMA: &str = "
    -- One row per (location, author); disabling flips `enabled`, never deletes.
    CREATE TABLE IF NOT EXISTS backup_configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        thread_id TEXT DEFAULT NULL,
        author_id TEXT NOT NULL,
        title TEXT DEFAULT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at DATETIME NOT NULL,
        last_check_time DATETIME DEFAULT NULL
    );
    -- NULL thread ids must collide too, so the identity index goes through IFNULL.
    CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_configs_identity
        ON backup_configs (guild_id, channel_id, IFNULL(thread_id, ''), author_id);
    CREATE INDEX IF NOT EXISTS idx_backup_configs_author ON backup_configs (author_id);

    -- message_id is globally unique: dedup relies on this constraint.
    CREATE TABLE IF NOT EXISTS message_backups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        config_id INTEGER NOT NULL REFERENCES backup_configs (id) ON DELETE CASCADE,
        message_id TEXT NOT NULL UNIQUE,
        content TEXT NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL,
        backup_time DATETIME NOT NULL,
        content_type TEXT NOT NULL DEFAULT 'channel'
    );
    CREATE INDEX IF NOT EXISTS idx_message_backups_config ON message_backups (config_id, created_at);

    CREATE TABLE IF NOT EXISTS file_backups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_backup_id INTEGER NOT NULL REFERENCES message_backups (id) ON DELETE CASCADE,
        original_filename TEXT NOT NULL,
        stored_location TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        source_url TEXT NOT NULL,
        backup_time DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_file_backups_message ON file_backups (message_backup_id);

    CREATE TABLE IF NOT EXISTS bot_status (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_activity_time DATETIME
    );

    CREATE TABLE IF NOT EXISTS scan_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        config_id INTEGER NOT NULL REFERENCES backup_configs (id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'pending',
        error TEXT DEFAULT NULL,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scan_tasks_status ON scan_tasks (status);
";
