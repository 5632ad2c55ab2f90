pub const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY,
        node_id INTEGER NOT NULL UNIQUE,
        long_name TEXT,
        short_name TEXT,
        mesh_id TEXT,
        role TEXT,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS packets (
        id INTEGER PRIMARY KEY,
        packet_id INTEGER NOT NULL UNIQUE,
        from_node_id INTEGER NOT NULL,
        sender_name TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        gateway_count INTEGER NOT NULL CHECK (gateway_count >= 1),
        rssi INTEGER,
        snr REAL,
        hop_start INTEGER,
        hop_limit INTEGER,
        hops_away INTEGER,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_packets_sent_at ON packets(sent_at);
    CREATE INDEX IF NOT EXISTS idx_packets_from ON packets(from_node_id);

    CREATE TABLE IF NOT EXISTS packet_gateways (
        packet_id INTEGER NOT NULL REFERENCES packets(packet_id) ON DELETE CASCADE,
        gateway_id TEXT NOT NULL,
        observed_at TEXT NOT NULL,
        UNIQUE (packet_id, gateway_id)
    );

    CREATE INDEX IF NOT EXISTS idx_gateways_gateway ON packet_gateways(gateway_id);
    CREATE INDEX IF NOT EXISTS idx_gateways_observed ON packet_gateways(observed_at);

    CREATE TABLE IF NOT EXISTS envelope_fingerprints (
        hash BLOB NOT NULL UNIQUE,
        seen_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY,
        user_node_id INTEGER NOT NULL UNIQUE,
        variant TEXT NOT NULL CHECK (variant IN ('low', 'avg', 'high')),
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS stat_cache (
        key TEXT NOT NULL UNIQUE,
        value TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS command_logs (
        id INTEGER PRIMARY KEY,
        user_node_id INTEGER NOT NULL,
        command TEXT NOT NULL,
        response_sent INTEGER NOT NULL DEFAULT 0,
        rate_limited INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_command_logs_user ON command_logs(user_node_id);
";
