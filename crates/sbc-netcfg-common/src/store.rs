//! Persistent intent store.
//!
//! Declared configuration lives in a single SQLite database opened once at
//! startup and shared by every orchestrator. Each intent row keeps its key
//! columns next to a JSON `data` column holding the full record.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{NetCfgError, NetCfgResult};
use crate::model::{
    DhcpPoolIntent, DhcpReservationIntent, DhcpSettings, FirewallRuleIntent,
    NetworkInterfaceIntent, StaticRouteIntent,
};

/// Keys of the `system_config` table.
pub mod keys {
    pub const DHCP_SERVICE: &str = "dhcp_service";
    pub const WAN: &str = "wan";
    pub const MULTI_WAN: &str = "multi_wan";
    pub const UPNP: &str = "upnp";
    pub const TRAFFIC_SHAPING: &str = "traffic_shaping";
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS network_interfaces (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS firewall_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chain TEXT NOT NULL,
        position INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        data TEXT NOT NULL,
        UNIQUE (chain, position)
    );

    CREATE TABLE IF NOT EXISTS dhcp_pool (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        interface TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS dhcp_reservations (
        mac TEXT PRIMARY KEY,
        ip TEXT NOT NULL,
        hostname TEXT
    );

    CREATE TABLE IF NOT EXISTS static_routes (
        destination TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS system_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// SQLite-backed store of declared configuration.
pub struct IntentStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for IntentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentStore").finish_non_exhaustive()
    }
}

impl IntentStore {
    /// Open or create the store at the given path
    ///
    /// Creates the database file and its tables if they don't exist.
    pub fn open(db_path: &Path) -> NetCfgResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| NetCfgError::io(parent, e))?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// An empty store that lives only as long as the process.
    pub fn open_in_memory() -> NetCfgResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> NetCfgResult<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Intent store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ----- interfaces -----

    pub fn list_interfaces(&self) -> NetCfgResult<Vec<NetworkInterfaceIntent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM network_interfaces ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let interfaces = rows
            .map(|data| -> NetCfgResult<NetworkInterfaceIntent> { Ok(serde_json::from_str(&data?)?) })
            .collect();
        interfaces
    }

    pub fn get_interface(&self, name: &str) -> NetCfgResult<Option<NetworkInterfaceIntent>> {
        let data: Option<String> = self
            .conn()
            .query_row(
                "SELECT data FROM network_interfaces WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(NetCfgError::from))
            .transpose()
    }

    pub fn upsert_interface(&self, intent: &NetworkInterfaceIntent) -> NetCfgResult<()> {
        let data = serde_json::to_string(intent)?;
        self.conn().execute(
            "INSERT INTO network_interfaces (name, data) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
            params![intent.name, data],
        )?;
        Ok(())
    }

    /// Returns true if a row was removed.
    pub fn delete_interface(&self, name: &str) -> NetCfgResult<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM network_interfaces WHERE name = ?1", [name])?;
        Ok(n > 0)
    }

    // ----- firewall rules -----

    /// All rules ordered by chain, then position.
    pub fn list_firewall_rules(&self) -> NetCfgResult<Vec<FirewallRuleIntent>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, data FROM firewall_rules ORDER BY chain, position")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut rules = Vec::new();
        for row in rows {
            let (id, data) = row?;
            let mut rule: FirewallRuleIntent = serde_json::from_str(&data)?;
            rule.id = Some(id);
            rules.push(rule);
        }
        Ok(rules)
    }

    pub fn get_firewall_rule(&self, id: i64) -> NetCfgResult<Option<FirewallRuleIntent>> {
        let data: Option<String> = self
            .conn()
            .query_row("SELECT data FROM firewall_rules WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(d) => {
                let mut rule: FirewallRuleIntent = serde_json::from_str(&d)?;
                rule.id = Some(id);
                Ok(Some(rule))
            }
            None => Ok(None),
        }
    }

    /// Position one past the last rule in `chain`.
    pub fn next_position(&self, chain: &str) -> NetCfgResult<u32> {
        let max: Option<u32> = self.conn().query_row(
            "SELECT MAX(position) FROM firewall_rules WHERE chain = ?1",
            [chain],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Inserts a rule at its position, shifting later rules in the chain down.
    ///
    /// Returns the new row id.
    pub fn insert_firewall_rule(&self, rule: &FirewallRuleIntent) -> NetCfgResult<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM firewall_rules WHERE chain = ?1 AND position = ?2)",
            params![rule.chain, rule.position],
            |row| row.get(0),
        )?;
        if taken {
            // Two passes keep UNIQUE(chain, position) satisfied row by row.
            tx.execute(
                "UPDATE firewall_rules SET position = -(position + 1)
                 WHERE chain = ?1 AND position >= ?2",
                params![rule.chain, rule.position],
            )?;
            tx.execute(
                "UPDATE firewall_rules SET position = -position WHERE chain = ?1 AND position < 0",
                params![rule.chain],
            )?;
            let shifted: Vec<(i64, u32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, position FROM firewall_rules WHERE chain = ?1 AND position > ?2",
                )?;
                let rows = stmt.query_map(params![rule.chain, rule.position], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };
            for (id, position) in shifted {
                let data: String =
                    tx.query_row("SELECT data FROM firewall_rules WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })?;
                let mut stored: FirewallRuleIntent = serde_json::from_str(&data)?;
                stored.position = position;
                tx.execute(
                    "UPDATE firewall_rules SET data = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&stored)?, id],
                )?;
            }
        }

        let mut stored = rule.clone();
        stored.id = None;
        tx.execute(
            "INSERT INTO firewall_rules (chain, position, enabled, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                stored.chain,
                stored.position,
                stored.enabled,
                serde_json::to_string(&stored)?
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Flips a rule's enabled flag. Returns false if the rule doesn't exist.
    pub fn set_firewall_rule_enabled(&self, id: i64, enabled: bool) -> NetCfgResult<bool> {
        let Some(mut rule) = self.get_firewall_rule(id)? else {
            return Ok(false);
        };
        rule.enabled = enabled;
        rule.id = None;
        self.conn().execute(
            "UPDATE firewall_rules SET enabled = ?1, data = ?2 WHERE id = ?3",
            params![enabled, serde_json::to_string(&rule)?, id],
        )?;
        Ok(true)
    }

    pub fn delete_firewall_rule(&self, id: i64) -> NetCfgResult<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM firewall_rules WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // ----- DHCP -----

    /// Service settings with the pool row folded in.
    pub fn dhcp_settings(&self) -> NetCfgResult<DhcpSettings> {
        let mut settings: DhcpSettings = self.get_config(keys::DHCP_SERVICE)?.unwrap_or_default();
        let pool: Option<String> = self
            .conn()
            .query_row("SELECT data FROM dhcp_pool WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        settings.pool = pool
            .map(|p| serde_json::from_str::<DhcpPoolIntent>(&p))
            .transpose()?;
        Ok(settings)
    }

    pub fn save_dhcp_settings(&self, settings: &DhcpSettings) -> NetCfgResult<()> {
        let service = DhcpSettings {
            pool: None,
            ..settings.clone()
        };
        self.put_config(keys::DHCP_SERVICE, &service)?;

        let conn = self.conn();
        match &settings.pool {
            Some(pool) => {
                conn.execute(
                    "INSERT INTO dhcp_pool (id, interface, data) VALUES (1, ?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET interface = excluded.interface, data = excluded.data",
                    params![pool.interface, serde_json::to_string(pool)?],
                )?;
            }
            None => {
                conn.execute("DELETE FROM dhcp_pool", [])?;
            }
        }
        Ok(())
    }

    /// Reservations in declaration order.
    pub fn list_reservations(&self) -> NetCfgResult<Vec<DhcpReservationIntent>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT mac, ip, hostname FROM dhcp_reservations ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mac, ip, hostname) = row?;
            let ip = ip.parse().map_err(|_| {
                NetCfgError::Serialization(format!("stored reservation {} has bad IP {}", mac, ip))
            })?;
            out.push(DhcpReservationIntent { mac, ip, hostname });
        }
        Ok(out)
    }

    /// Inserts or replaces the reservation for its MAC, keeping its slot.
    pub fn upsert_reservation(&self, reservation: &DhcpReservationIntent) -> NetCfgResult<()> {
        self.conn().execute(
            "INSERT INTO dhcp_reservations (mac, ip, hostname) VALUES (?1, ?2, ?3)
             ON CONFLICT(mac) DO UPDATE SET ip = excluded.ip, hostname = excluded.hostname",
            params![
                reservation.mac,
                reservation.ip.to_string(),
                reservation.hostname
            ],
        )?;
        Ok(())
    }

    pub fn delete_reservation(&self, mac: &str) -> NetCfgResult<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM dhcp_reservations WHERE mac = ?1", [mac])?;
        Ok(n > 0)
    }

    // ----- static routes -----

    pub fn list_static_routes(&self) -> NetCfgResult<Vec<StaticRouteIntent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM static_routes ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let routes = rows
            .map(|data| -> NetCfgResult<StaticRouteIntent> { Ok(serde_json::from_str(&data?)?) })
            .collect();
        routes
    }

    pub fn upsert_static_route(&self, route: &StaticRouteIntent) -> NetCfgResult<()> {
        self.conn().execute(
            "INSERT INTO static_routes (destination, data) VALUES (?1, ?2)
             ON CONFLICT(destination) DO UPDATE SET data = excluded.data",
            params![route.destination.to_string(), serde_json::to_string(route)?],
        )?;
        Ok(())
    }

    pub fn delete_static_route(&self, destination: &str) -> NetCfgResult<bool> {
        let n = self.conn().execute(
            "DELETE FROM static_routes WHERE destination = ?1",
            [destination],
        )?;
        Ok(n > 0)
    }

    // ----- system_config -----

    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> NetCfgResult<Option<T>> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| serde_json::from_str(&v).map_err(NetCfgError::from))
            .transpose()
    }

    pub fn put_config<T: Serialize>(&self, key: &str, value: &T) -> NetCfgResult<()> {
        self.conn().execute(
            "INSERT INTO system_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DhcpMode, Protocol, RuleAction, WanSettings};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn store() -> IntentStore {
        IntentStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("netcfg.db");
        let store = IntentStore::open(&path).unwrap();
        store
            .upsert_interface(&NetworkInterfaceIntent::dhcp("eth0"))
            .unwrap();
        drop(store);

        let reopened = IntentStore::open(&path).unwrap();
        assert_eq!(reopened.list_interfaces().unwrap().len(), 1);
    }

    #[test]
    fn test_interface_upsert_and_delete() {
        let store = store();
        let mut eth0 = NetworkInterfaceIntent::dhcp("eth0");
        store.upsert_interface(&eth0).unwrap();
        store.upsert_interface(&NetworkInterfaceIntent::dhcp("br0")).unwrap();

        eth0.enabled = false;
        store.upsert_interface(&eth0).unwrap();

        let all = store.list_interfaces().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "br0");
        assert!(!store.get_interface("eth0").unwrap().unwrap().enabled);

        assert!(store.delete_interface("eth0").unwrap());
        assert!(!store.delete_interface("eth0").unwrap());
        assert!(store.get_interface("eth0").unwrap().is_none());
    }

    #[test]
    fn test_firewall_insert_shifts_positions() {
        let store = store();
        let a = FirewallRuleIntent::new("INPUT", RuleAction::Accept)
            .with_protocol(Protocol::Tcp)
            .with_comment("a");
        let b = FirewallRuleIntent::new("INPUT", RuleAction::Drop).with_position(1);
        store.insert_firewall_rule(&a).unwrap();
        store.insert_firewall_rule(&b).unwrap();
        assert_eq!(store.next_position("INPUT").unwrap(), 2);
        assert_eq!(store.next_position("FORWARD").unwrap(), 0);

        // Insert at the head; the two existing rules move to 1 and 2.
        let head = FirewallRuleIntent::new("INPUT", RuleAction::Reject).with_position(0);
        let head_id = store.insert_firewall_rule(&head).unwrap();

        let rules = store.list_firewall_rules().unwrap();
        let positions: Vec<(u32, &str)> = rules
            .iter()
            .map(|r| (r.position, r.action.target()))
            .collect();
        assert_eq!(positions, vec![(0, "REJECT"), (1, "ACCEPT"), (2, "DROP")]);
        assert_eq!(rules[0].id, Some(head_id));
    }

    #[test]
    fn test_firewall_enable_and_delete() {
        let store = store();
        let id = store
            .insert_firewall_rule(&FirewallRuleIntent::new("FORWARD", RuleAction::Accept))
            .unwrap();
        assert!(store.set_firewall_rule_enabled(id, false).unwrap());
        assert!(!store.get_firewall_rule(id).unwrap().unwrap().enabled);
        assert!(!store.set_firewall_rule_enabled(id + 100, false).unwrap());
        assert!(store.delete_firewall_rule(id).unwrap());
        assert!(store.list_firewall_rules().unwrap().is_empty());
    }

    #[test]
    fn test_reservation_replaced_in_place() {
        let store = store();
        let first =
            DhcpReservationIntent::new("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 50), Some("nas"))
                .unwrap();
        let second =
            DhcpReservationIntent::new("aa:bb:cc:dd:ee:02", Ipv4Addr::new(192, 168, 1, 51), None)
                .unwrap();
        store.upsert_reservation(&first).unwrap();
        store.upsert_reservation(&second).unwrap();

        let moved =
            DhcpReservationIntent::new("AA:BB:CC:DD:EE:01", Ipv4Addr::new(192, 168, 1, 60), Some("nas"))
                .unwrap();
        store.upsert_reservation(&moved).unwrap();

        let all = store.list_reservations().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(all[0].ip, Ipv4Addr::new(192, 168, 1, 60));
        assert_eq!(all[1].mac, "aa:bb:cc:dd:ee:02");
    }

    #[test]
    fn test_dhcp_settings_round_trip() {
        let store = store();
        assert_eq!(store.dhcp_settings().unwrap(), DhcpSettings::default());

        let settings = DhcpSettings {
            mode: DhcpMode::Server,
            pool: Some(DhcpPoolIntent::new(
                "br0",
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 200),
            )),
            ..Default::default()
        };
        store.save_dhcp_settings(&settings).unwrap();
        assert_eq!(store.dhcp_settings().unwrap(), settings);

        let disabled = DhcpSettings {
            mode: DhcpMode::Disabled,
            ..Default::default()
        };
        store.save_dhcp_settings(&disabled).unwrap();
        assert_eq!(store.dhcp_settings().unwrap(), disabled);
    }

    #[test]
    fn test_static_routes() {
        let store = store();
        let route = StaticRouteIntent::via("10.0.0.0/8".parse().unwrap(), Ipv4Addr::new(192, 168, 1, 254));
        store.upsert_static_route(&route).unwrap();
        store
            .upsert_static_route(&route.clone().with_metric(50))
            .unwrap();
        let routes = store.list_static_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 50);
        assert!(store.delete_static_route("10.0.0.0/8").unwrap());
        assert!(store.list_static_routes().unwrap().is_empty());
    }

    #[test]
    fn test_system_config() {
        let store = store();
        assert!(store.get_config::<WanSettings>(keys::WAN).unwrap().is_none());
        let wan = WanSettings::default();
        store.put_config(keys::WAN, &wan).unwrap();
        assert_eq!(store.get_config::<WanSettings>(keys::WAN).unwrap(), Some(wan));
    }
}
