use crate::error::{Error, Result};
use crate::model::{
    Hardware, HardwareDescription, Media, MediaDescription, MediaFormat, MediaInterface,
    MediaType, Nic, NicDescription, NicModel, Status, Vm, VmDescription,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// A bare VM row without its owned Hardware, as returned by listing queries
/// that don't need the full join (registry startup scan, `get_vm_list`).
#[derive(Debug, Clone)]
pub struct VmRow {
    pub id: i64,
    pub name: String,
    pub status: Status,
    pub autostart: bool,
}

/// SQLite-backed persistence for VM/Hardware/NIC/Media rows.
///
/// Every public method opens its statement(s), does its work, and returns —
/// no handle outlives a single call (spec.md §9 "persistent session
/// scoping").
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts a new VM and its Hardware/NIC/Media rows in one transaction.
    /// Fails with `DuplicateName` if the name already exists.
    pub fn insert_vm(&self, desc: &VmDescription) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) FROM vm WHERE name = ?1",
            [&desc.name],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )?;
        if exists {
            return Err(Error::DuplicateName(desc.name.clone()));
        }

        let now = tx.query_row("SELECT unixepoch()", [], |row| row.get::<_, i64>(0))?;

        tx.execute(
            "INSERT INTO vm (name, status, since, pid, autostart) VALUES (?1, ?2, ?3, NULL, ?4)",
            params![desc.name, Status::New.to_string(), now, desc.autostart],
        )?;
        let vm_id = tx.last_insert_rowid();

        insert_hardware(&tx, vm_id, &desc.hardware)?;

        // Reconciliation step happens at the supervisor level; the row is
        // born NEW and immediately observed STOPPED on registry startup.
        tx.execute(
            "UPDATE vm SET status = ?1 WHERE id = ?2",
            params![Status::Stopped.to_string(), vm_id],
        )?;

        tx.commit()?;
        Ok(vm_id)
    }

    pub fn delete_vm(&self, vm_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM vm WHERE id = ?1", [vm_id])?;
        if affected == 0 {
            return Err(Error::UnknownVm(vm_id.to_string()));
        }
        Ok(())
    }

    pub fn get_vm(&self, vm_id: i64) -> Result<Vm> {
        let conn = self.conn.lock().unwrap();
        load_vm(&conn, vm_id)
    }

    pub fn get_vm_by_name(&self, name: &str) -> Result<Vm> {
        let conn = self.conn.lock().unwrap();
        let vm_id: i64 = conn
            .query_row("SELECT id FROM vm WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
            .ok_or_else(|| Error::UnknownVm(name.to_string()))?;
        load_vm(&conn, vm_id)
    }

    pub fn list_vms(&self) -> Result<Vec<VmRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, status, autostart FROM vm ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let status_str: String = row.get(2)?;
            Ok(VmRow {
                id: row.get(0)?,
                name: row.get(1)?,
                status: parse_status(&status_str)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                autostart: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    pub fn list_autostart(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM vm WHERE autostart = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    pub fn update_status(&self, vm_id: i64, status: Status) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = conn.query_row("SELECT unixepoch()", [], |row| row.get::<_, i64>(0))?;
        let affected = conn.execute(
            "UPDATE vm SET status = ?1, since = ?2 WHERE id = ?3",
            params![status.to_string(), now, vm_id],
        )?;
        if affected == 0 {
            return Err(Error::UnknownVm(vm_id.to_string()));
        }
        Ok(())
    }

    pub fn update_pid(&self, vm_id: i64, pid: Option<i32>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE vm SET pid = ?1 WHERE id = ?2", params![pid, vm_id])?;
        Ok(())
    }

    pub fn set_autostart(&self, vm_id: i64, autostart: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE vm SET autostart = ?1 WHERE id = ?2",
            params![autostart, vm_id],
        )?;
        if affected == 0 {
            return Err(Error::UnknownVm(vm_id.to_string()));
        }
        Ok(())
    }

    pub fn update_hardware(&self, vm_id: i64, desc: &HardwareDescription) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE hardware SET ram_m = ?1, cpus = ?2, boot = ?3, rtc_utc = ?4 WHERE vm_id = ?5",
            params![
                desc.ram_m,
                desc.cpus,
                desc.boot.to_string(),
                desc.rtc_utc,
                vm_id
            ],
        )?;
        if affected == 0 {
            return Err(Error::UnknownVm(vm_id.to_string()));
        }
        Ok(())
    }

    pub fn add_nic(&self, vm_id: i64, desc: &NicDescription) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nic (vm_id, model, mac, master, mtu) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vm_id, nic_model_str(desc.model), desc.mac, desc.master, desc.mtu],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn del_nic(&self, vm_id: i64, nic_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM nic WHERE id = ?1 AND vm_id = ?2",
            params![nic_id, vm_id],
        )?;
        if affected == 0 {
            return Err(Error::UnknownVm(format!("nic {nic_id} on vm {vm_id}")));
        }
        Ok(())
    }

    pub fn add_media(&self, vm_id: i64, desc: &MediaDescription) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO media (vm_id, type, path, format, readonly, interface, host_cache)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                vm_id,
                media_type_str(desc.kind),
                desc.path,
                media_format_str(desc.format),
                desc.readonly,
                media_interface_str(desc.interface),
                desc.host_cache
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn del_media(&self, vm_id: i64, media_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM media WHERE id = ?1 AND vm_id = ?2",
            params![media_id, vm_id],
        )?;
        if affected == 0 {
            return Err(Error::UnknownVm(format!("media {media_id} on vm {vm_id}")));
        }
        Ok(())
    }
}

fn insert_hardware(tx: &rusqlite::Transaction<'_>, vm_id: i64, desc: &HardwareDescription) -> Result<()> {
    let product_uuid = Uuid::new_v4();
    tx.execute(
        "INSERT INTO hardware (vm_id, ram_m, cpus, boot, rtc_utc, product_uuid) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            vm_id,
            desc.ram_m,
            desc.cpus,
            desc.boot.to_string(),
            desc.rtc_utc,
            product_uuid.to_string()
        ],
    )?;

    for nic in &desc.nics {
        tx.execute(
            "INSERT INTO nic (vm_id, model, mac, master, mtu) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vm_id, nic_model_str(nic.model), nic.mac, nic.master, nic.mtu],
        )?;
    }

    for media in &desc.media {
        tx.execute(
            "INSERT INTO media (vm_id, type, path, format, readonly, interface, host_cache)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                vm_id,
                media_type_str(media.kind),
                media.path,
                media_format_str(media.format),
                media.readonly,
                media_interface_str(media.interface),
                media.host_cache
            ],
        )?;
    }

    Ok(())
}

fn load_vm(conn: &Connection, vm_id: i64) -> Result<Vm> {
    let (name, status_str, since, pid, autostart) = conn
        .query_row(
            "SELECT name, status, since, pid, autostart FROM vm WHERE id = ?1",
            [vm_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i32>>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| Error::UnknownVm(vm_id.to_string()))?;

    let (ram_m, cpus, boot_str, rtc_utc, product_uuid_str) = conn.query_row(
        "SELECT ram_m, cpus, boot, rtc_utc, product_uuid FROM hardware WHERE vm_id = ?1",
        [vm_id],
        |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    )?;

    let mut nic_stmt = conn.prepare("SELECT id, model, mac, master, mtu FROM nic WHERE vm_id = ?1 ORDER BY id")?;
    let nics = nic_stmt
        .query_map([vm_id], |row| {
            let model_str: String = row.get(1)?;
            Ok(Nic {
                id: row.get(0)?,
                model: parse_nic_model(&model_str)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                mac: row.get(2)?,
                master: row.get(3)?,
                mtu: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut media_stmt = conn.prepare(
        "SELECT id, type, path, format, readonly, interface, host_cache FROM media WHERE vm_id = ?1 ORDER BY id",
    )?;
    let media = media_stmt
        .query_map([vm_id], |row| {
            let kind_str: String = row.get(1)?;
            let format_str: String = row.get(3)?;
            let interface_str: String = row.get(5)?;
            Ok(Media {
                id: row.get(0)?,
                kind: parse_media_type(&kind_str)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                path: row.get(2)?,
                format: parse_media_format(&format_str)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                readonly: row.get(4)?,
                interface: parse_media_interface(&interface_str)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                host_cache: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let hardware = Hardware {
        ram_m,
        cpus,
        boot: boot_str.chars().next().unwrap_or('d'),
        rtc_utc,
        product_uuid: Uuid::parse_str(&product_uuid_str)
            .map_err(|e| Error::Internal(format!("corrupt product_uuid: {e}")))?,
        nics,
        media,
    };

    Ok(Vm {
        id: vm_id,
        name,
        status: parse_status(&status_str)?,
        since,
        pid,
        autostart,
        hardware,
    })
}

fn parse_status(s: &str) -> Result<Status> {
    Ok(match s {
        "NEW" => Status::New,
        "CONFIGURING" => Status::Configuring,
        "STOPPED" => Status::Stopped,
        "STARTING" => Status::Starting,
        "RUNNING" => Status::Running,
        "STOPPING" => Status::Stopping,
        other => return Err(Error::Internal(format!("corrupt status value: {other}"))),
    })
}

fn nic_model_str(model: NicModel) -> &'static str {
    match model {
        NicModel::VirtioNet => "virtio-net",
        NicModel::Sungem => "sungem",
        NicModel::UsbNet => "usb-net",
        NicModel::Rtl8139 => "rtl8139",
        NicModel::Pcnet => "pcnet",
        NicModel::E1000 => "e1000",
    }
}

fn parse_nic_model(s: &str) -> Result<NicModel> {
    Ok(match s {
        "virtio-net" => NicModel::VirtioNet,
        "sungem" => NicModel::Sungem,
        "usb-net" => NicModel::UsbNet,
        "rtl8139" => NicModel::Rtl8139,
        "pcnet" => NicModel::Pcnet,
        "e1000" => NicModel::E1000,
        other => return Err(Error::Internal(format!("corrupt nic model: {other}"))),
    })
}

fn media_type_str(kind: MediaType) -> &'static str {
    match kind {
        MediaType::Disk => "disk",
        MediaType::Cdrom => "cdrom",
    }
}

fn parse_media_type(s: &str) -> Result<MediaType> {
    Ok(match s {
        "disk" => MediaType::Disk,
        "cdrom" => MediaType::Cdrom,
        other => return Err(Error::Internal(format!("corrupt media type: {other}"))),
    })
}

fn media_format_str(format: MediaFormat) -> &'static str {
    match format {
        MediaFormat::Raw => "raw",
        MediaFormat::Qcow2 => "qcow2",
    }
}

fn parse_media_format(s: &str) -> Result<MediaFormat> {
    Ok(match s {
        "raw" => MediaFormat::Raw,
        "qcow2" => MediaFormat::Qcow2,
        other => return Err(Error::Internal(format!("corrupt media format: {other}"))),
    })
}

fn media_interface_str(interface: MediaInterface) -> &'static str {
    match interface {
        MediaInterface::Virtio => "virtio",
        MediaInterface::Ide => "ide",
        MediaInterface::Floppy => "floppy",
    }
}

fn parse_media_interface(s: &str) -> Result<MediaInterface> {
    Ok(match s {
        "virtio" => MediaInterface::Virtio,
        "ide" => MediaInterface::Ide,
        "floppy" => MediaInterface::Floppy,
        other => return Err(Error::Internal(format!("corrupt media interface: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HardwareDescription;

    fn desc(name: &str) -> VmDescription {
        VmDescription {
            name: name.to_string(),
            hardware: HardwareDescription {
                ram_m: 256,
                cpus: 1,
                boot: 'd',
                rtc_utc: true,
                nics: vec![],
                media: vec![],
            },
            autostart: false,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_vm(&desc("demo")).unwrap();
        let vm = store.get_vm(id).unwrap();
        assert_eq!(vm.name, "demo");
        assert_eq!(vm.status, Status::Stopped);
        assert_eq!(vm.hardware.ram_m, 256);
    }

    #[test]
    fn duplicate_name_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_vm(&desc("demo")).unwrap();
        let result = store.insert_vm(&desc("demo"));
        assert!(matches!(result, Err(Error::DuplicateName(_))));
    }

    #[test]
    fn delete_cascades_to_hardware() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_vm(&desc("demo")).unwrap();
        store.delete_vm(id).unwrap();
        let result = store.get_vm(id);
        assert!(matches!(result, Err(Error::UnknownVm(_))));
    }

    #[test]
    fn add_and_delete_nic() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_vm(&desc("demo")).unwrap();
        let nic_id = store
            .add_nic(
                id,
                &NicDescription {
                    model: NicModel::VirtioNet,
                    mac: "52:54:00:12:34:56".into(),
                    master: "br0".into(),
                    mtu: 1500,
                },
            )
            .unwrap();

        let vm = store.get_vm(id).unwrap();
        assert_eq!(vm.hardware.nics.len(), 1);

        store.del_nic(id, nic_id).unwrap();
        let vm = store.get_vm(id).unwrap();
        assert_eq!(vm.hardware.nics.len(), 0);
    }

    #[test]
    fn list_autostart_filters_correctly() {
        let store = Store::open_in_memory().unwrap();
        let mut d = desc("a");
        d.autostart = true;
        let id_a = store.insert_vm(&d).unwrap();
        store.insert_vm(&desc("b")).unwrap();

        let autostart = store.list_autostart().unwrap();
        assert_eq!(autostart, vec![id_a]);
    }
}
