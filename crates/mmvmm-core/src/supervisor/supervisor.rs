use super::commands::{Command, Reply};
use crate::error::{Error, Result};
use crate::model::{HardwareDescription, MediaDescription, NicDescription, Status, Vm};
use crate::net::{TapDevice, TapManager};
use crate::qemu::{self, QemuProcess, QmpEvent, QmpMonitor};
use crate::store::Store;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(5);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to one VM's dedicated supervisor thread.
///
/// The event loop itself lives on the spawned thread; everything here just
/// talks to it over `tx`. `is_alive()` lets the registry's periodic respawn
/// check notice a thread that died of a bug in the loop itself.
pub struct SupervisorHandle {
    vm_id: i64,
    name: String,
    tx: Sender<Command>,
    join: Mutex<Option<JoinHandle<()>>>,
    funky: AtomicBool,
}

impl SupervisorHandle {
    pub fn spawn(
        vm_id: i64,
        name: String,
        store: Store,
        tap_manager: TapManager,
        qemu_path: String,
        socket_dir: PathBuf,
    ) -> Self {
        let (tx, rx) = channel();
        let self_tx = tx.clone();
        let thread_name = name.clone();

        let join = std::thread::Builder::new()
            .name(format!("vm-{thread_name}"))
            .spawn(move || {
                let span = tracing::info_span!("vm", name = %thread_name, vm_id);
                let _enter = span.enter();
                let mut sup = Supervisor {
                    vm_id,
                    store,
                    tap_manager,
                    qemu_path,
                    socket_dir,
                    self_tx,
                    process: None,
                    qmp: None,
                    taps: Vec::new(),
                    killed_by_us: false,
                    stopping_deadline: None,
                };
                sup.run(rx);
            })
            .expect("failed to spawn supervisor thread");

        Self {
            vm_id,
            name,
            tx,
            join: Mutex::new(Some(join)),
            funky: AtomicBool::new(false),
        }
    }

    pub fn vm_id(&self) -> i64 {
        self.vm_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the event-loop thread is still running. `false` means the
    /// loop panicked or otherwise exited without a `Stop` sentinel — the
    /// registry's periodic check treats this as a bug to respawn around.
    pub fn is_alive(&self) -> bool {
        self.join
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn mark_funky(&self) {
        self.funky.store(true, Ordering::SeqCst);
    }

    pub fn is_funky(&self) -> bool {
        self.funky.load(Ordering::SeqCst)
    }

    /// Sends the `Stop` sentinel and joins the thread. Idempotent.
    pub fn stop_loop(&self) {
        let _ = self.tx.send(Command::Stop);
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| Error::Internal(format!("supervisor loop for vm {} is gone", self.vm_id)))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal(format!("supervisor for vm {} dropped its reply", self.vm_id)))?
    }

    pub async fn start(&self) -> Result<()> {
        self.call(Command::Start).await
    }

    pub async fn poweroff(&self) -> Result<()> {
        self.call(Command::PowerOff).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.call(Command::Reset).await
    }

    pub async fn terminate(&self, kill: bool) -> Result<()> {
        self.call(|reply| Command::Terminate { kill, reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.call(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.call(Command::Resume).await
    }

    pub async fn add_nic(&self, desc: NicDescription) -> Result<i64> {
        self.call(|reply| Command::AddNic { desc, reply }).await
    }

    pub async fn del_nic(&self, nic_id: i64) -> Result<()> {
        self.call(|reply| Command::DelNic { nic_id, reply }).await
    }

    pub async fn add_media(&self, desc: MediaDescription) -> Result<i64> {
        self.call(|reply| Command::AddMedia { desc, reply }).await
    }

    pub async fn del_media(&self, media_id: i64) -> Result<()> {
        self.call(|reply| Command::DelMedia { media_id, reply }).await
    }

    pub async fn update_hardware(&self, desc: HardwareDescription) -> Result<()> {
        self.call(|reply| Command::UpdateHardware { desc, reply }).await
    }

    pub async fn set_autostart(&self, autostart: bool) -> Result<()> {
        self.call(|reply| Command::SetAutostart { autostart, reply }).await
    }

    pub async fn info(&self) -> Result<Vm> {
        self.call(Command::Info).await
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.call(Command::IsRunning).await
    }
}

/// The event loop state. Runs on its own thread; every mutation of
/// Status/PID/hardware happens here, never from a caller thread directly
/// (spec.md §4.4).
struct Supervisor {
    vm_id: i64,
    store: Store,
    tap_manager: TapManager,
    qemu_path: String,
    socket_dir: PathBuf,
    self_tx: Sender<Command>,

    process: Option<QemuProcess>,
    qmp: Option<Arc<QmpMonitor>>,
    taps: Vec<TapDevice>,
    /// Whether *we* sent the fatal signal this stop cycle, vs. QEMU exiting
    /// on its own (SHUTDOWN event) or crashing. Determines whether the QMP
    /// socket file needs unlinking on disconnect.
    killed_by_us: bool,
    /// Set when entering STOPPING without a synchronous cleanup; the
    /// periodic tick escalates to SIGKILL if it elapses with no SHUTDOWN.
    stopping_deadline: Option<Instant>,
}

impl Supervisor {
    fn run(&mut self, rx: Receiver<Command>) {
        loop {
            match rx.recv_timeout(QUEUE_TIMEOUT) {
                Ok(Command::Stop) => break,
                Ok(cmd) => self.dispatch(cmd),
                Err(RecvTimeoutError::Timeout) => self.periodic_tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => self.reply(reply, |s| s.do_start()),
            Command::PowerOff(reply) => self.reply(reply, |s| s.do_poweroff()),
            Command::Reset(reply) => self.reply(reply, |s| s.do_reset()),
            Command::Terminate { kill, reply } => self.reply(reply, move |s| s.do_terminate(kill)),
            Command::Pause(reply) => self.reply(reply, |s| s.do_qmp_passthrough("stop")),
            Command::Resume(reply) => self.reply(reply, |s| s.do_qmp_passthrough("cont")),
            Command::AddNic { desc, reply } => self.reply(reply, move |s| s.do_add_nic(desc)),
            Command::DelNic { nic_id, reply } => self.reply(reply, move |s| s.do_del_nic(nic_id)),
            Command::AddMedia { desc, reply } => self.reply(reply, move |s| s.do_add_media(desc)),
            Command::DelMedia { media_id, reply } => self.reply(reply, move |s| s.do_del_media(media_id)),
            Command::UpdateHardware { desc, reply } => {
                self.reply(reply, move |s| s.do_update_hardware(desc))
            }
            Command::SetAutostart { autostart, reply } => {
                self.reply(reply, move |s| s.do_set_autostart(autostart))
            }
            Command::Info(reply) => self.reply(reply, |s| s.store.get_vm(s.vm_id)),
            Command::IsRunning(reply) => self.reply(reply, |s| s.do_is_running()),
            Command::QmpShutdown => {
                tracing::info!("QMP SHUTDOWN event received");
                self.do_cleanup();
            }
            Command::QmpNegotiationComplete => {
                tracing::info!("QMP negotiation complete, VM is running");
                if let Err(e) = self.store.update_status(self.vm_id, Status::Running) {
                    tracing::error!(error = %e, "failed to persist RUNNING status");
                }
            }
            Command::QmpNegotiationFailed(reason) => {
                tracing::warn!(reason = %reason, "QMP negotiation failed");
                self.teardown_failed_start();
            }
            Command::QmpConnectionLost(reason) => {
                tracing::warn!(reason = %reason, "QMP connection lost, treating as a crash signal");
                self.do_cleanup();
            }
            Command::Stop => unreachable!("Stop is consumed by run() before dispatch"),
        }
    }

    fn reply<T>(&mut self, reply: Reply<T>, f: impl FnOnce(&mut Self) -> Result<T>) {
        let result = f(self);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "supervisor command failed");
        }
        let _ = reply.send(result);
    }

    fn is_process_alive(&self) -> bool {
        self.process.as_ref().map(|p| p.is_alive()).unwrap_or(false)
    }

    fn do_start(&mut self) -> Result<()> {
        if self.is_process_alive() {
            return Err(Error::VmRunning);
        }

        self.store.update_status(self.vm_id, Status::Starting)?;

        if let Some(stale) = self.qmp.take() {
            stale.disconnect(true);
        }

        let vm = self.store.get_vm(self.vm_id)?;
        let socket_path = qemu::allocate_socket_path(&self.socket_dir)?;
        let argv = qemu::build_argv(&vm.name, vm.id, &vm.hardware, &socket_path);

        let mut created_taps = Vec::with_capacity(vm.hardware.nics.len());
        for nic in &vm.hardware.nics {
            match self.tap_manager.create(nic.id, &nic.master, nic.mtu) {
                Ok(tap) => created_taps.push(tap),
                Err(e) => {
                    for tap in created_taps {
                        let _ = tap.free();
                    }
                    let _ = self.store.update_status(self.vm_id, Status::Stopped);
                    return Err(e);
                }
            }
        }

        let process = match QemuProcess::spawn(&self.qemu_path, &argv) {
            Ok(p) => p,
            Err(e) => {
                for tap in created_taps {
                    let _ = tap.free();
                }
                let _ = self.store.update_status(self.vm_id, Status::Stopped);
                return Err(e);
            }
        };

        self.store.update_pid(self.vm_id, Some(process.pid()))?;
        self.taps = created_taps;
        self.process = Some(process);
        self.killed_by_us = false;
        self.stopping_deadline = None;

        let qmp = Arc::new(QmpMonitor::new(socket_path));
        let notify_tx = self.self_tx.clone();
        qmp.start(move |event| {
            let cmd = match event {
                QmpEvent::NegotiationComplete => Command::QmpNegotiationComplete,
                QmpEvent::NegotiationFailed(reason) => Command::QmpNegotiationFailed(reason),
                QmpEvent::Shutdown => Command::QmpShutdown,
                QmpEvent::ConnectionLost(reason) => Command::QmpConnectionLost(reason),
            };
            let _ = notify_tx.send(cmd);
        });
        self.qmp = Some(qmp);

        Ok(())
    }

    fn do_poweroff(&mut self) -> Result<()> {
        if !self.is_process_alive() {
            return Err(Error::VmNotRunning);
        }
        self.store.update_status(self.vm_id, Status::Stopping)?;

        let qmp = self.qmp.clone();
        let sent = match &qmp {
            Some(qmp) => qmp.send_command("system_powerdown", None, QMP_COMMAND_TIMEOUT),
            None => Err(Error::QmpConnectionError("no QMP monitor attached".into())),
        };

        match sent {
            Ok(_) => {
                self.stopping_deadline = Some(Instant::now() + GRACEFUL_STOP_TIMEOUT);
            }
            Err(_) => {
                // No SHUTDOWN event will ever arrive over a broken channel,
                // so there is nothing to wait for.
                if let Some(p) = &self.process {
                    let _ = p.sigterm();
                }
                self.do_cleanup();
            }
        }
        Ok(())
    }

    fn do_terminate(&mut self, kill: bool) -> Result<()> {
        if !self.is_process_alive() {
            return Err(Error::VmNotRunning);
        }
        self.store.update_status(self.vm_id, Status::Stopping)?;

        if kill {
            if let Some(p) = &self.process {
                p.sigkill()?;
            }
            self.killed_by_us = true;
            self.do_cleanup();
        } else {
            if let Some(p) = &self.process {
                p.sigterm()?;
            }
            self.stopping_deadline = Some(Instant::now() + GRACEFUL_STOP_TIMEOUT);
        }
        Ok(())
    }

    fn do_reset(&mut self) -> Result<()> {
        if !self.is_process_alive() {
            return Err(Error::VmNotRunning);
        }
        let qmp = self
            .qmp
            .as_ref()
            .ok_or_else(|| Error::QmpConnectionError("no QMP monitor attached".into()))?;
        qmp.send_command("system_reset", None, QMP_COMMAND_TIMEOUT)?;
        Ok(())
    }

    /// `stop`/`cont` QMP passthrough (pause/resume); orthogonal to Status.
    fn do_qmp_passthrough(&mut self, qmp_command: &str) -> Result<()> {
        if !self.is_process_alive() {
            return Err(Error::VmNotRunning);
        }
        let qmp = self
            .qmp
            .as_ref()
            .ok_or_else(|| Error::QmpConnectionError("no QMP monitor attached".into()))?;
        qmp.send_command(qmp_command, None, QMP_COMMAND_TIMEOUT)?;
        Ok(())
    }

    fn do_cleanup(&mut self) {
        if let Ok(vm) = self.store.get_vm(self.vm_id) {
            if vm.status != Status::Stopping {
                let _ = self.store.update_status(self.vm_id, Status::Stopping);
            }
        }

        let deadline = Instant::now() + CHILD_EXIT_WAIT;
        while self.is_process_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        if self.is_process_alive() {
            if let Some(p) = &self.process {
                if let Err(e) = p.sigkill() {
                    tracing::warn!(error = %e, "SIGKILL failed during cleanup");
                }
            }
            self.killed_by_us = true;
            std::thread::sleep(Duration::from_millis(200));
        }
        self.process = None;

        for tap in self.taps.drain(..) {
            if let Err(e) = tap.free() {
                tracing::warn!(error = %e, "failed to free TAP device during cleanup");
            }
        }

        if let Some(qmp) = self.qmp.take() {
            qmp.disconnect(self.killed_by_us);
        }
        self.killed_by_us = false;
        self.stopping_deadline = None;

        if let Err(e) = self.store.update_pid(self.vm_id, None) {
            tracing::error!(error = %e, "failed to clear pid after cleanup");
        }
        if let Err(e) = self.store.update_status(self.vm_id, Status::Stopped) {
            tracing::error!(error = %e, "failed to persist STOPPED status after cleanup");
        }
    }

    fn teardown_failed_start(&mut self) {
        if let Some(p) = self.process.take() {
            if p.is_alive() {
                let _ = p.sigkill();
            }
        }
        for tap in self.taps.drain(..) {
            if let Err(e) = tap.free() {
                tracing::warn!(error = %e, "failed to free TAP device after failed start");
            }
        }
        if let Some(qmp) = self.qmp.take() {
            qmp.disconnect(true);
        }
        if let Err(e) = self.store.update_pid(self.vm_id, None) {
            tracing::error!(error = %e, "failed to clear pid after failed start");
        }
        if let Err(e) = self.store.update_status(self.vm_id, Status::Stopped) {
            tracing::error!(error = %e, "failed to reset status after failed start");
        }
    }

    fn periodic_tick(&mut self) {
        if let Some(deadline) = self.stopping_deadline {
            if Instant::now() >= deadline {
                if self.is_process_alive() {
                    if let Some(p) = &self.process {
                        if let Err(e) = p.sigkill() {
                            tracing::warn!(error = %e, "SIGKILL failed after graceful-stop timeout");
                        }
                    }
                    self.killed_by_us = true;
                }
                self.stopping_deadline = None;
                self.do_cleanup();
            }
            return;
        }

        match self.store.get_vm(self.vm_id) {
            Ok(vm) if vm.status == Status::Running && !self.is_process_alive() => {
                tracing::warn!("QEMU process vanished without a SHUTDOWN event, marking crashed");
                self.do_cleanup();
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "periodic task failed to read VM status"),
        }
    }

    fn require_stopped(&self) -> Result<Vm> {
        let vm = self.store.get_vm(self.vm_id)?;
        if vm.status != Status::Stopped {
            return Err(Error::VmRunning);
        }
        Ok(vm)
    }

    fn do_add_nic(&mut self, desc: NicDescription) -> Result<i64> {
        desc.validate()?;
        self.require_stopped()?;
        self.store.add_nic(self.vm_id, &desc)
    }

    fn do_del_nic(&mut self, nic_id: i64) -> Result<()> {
        self.require_stopped()?;
        self.store.del_nic(self.vm_id, nic_id)
    }

    fn do_add_media(&mut self, desc: MediaDescription) -> Result<i64> {
        desc.validate()?;
        self.require_stopped()?;
        self.store.add_media(self.vm_id, &desc)
    }

    fn do_del_media(&mut self, media_id: i64) -> Result<()> {
        self.require_stopped()?;
        self.store.del_media(self.vm_id, media_id)
    }

    fn do_update_hardware(&mut self, desc: HardwareDescription) -> Result<()> {
        desc.validate()?;
        self.require_stopped()?;
        self.store.update_hardware(self.vm_id, &desc)
    }

    fn do_set_autostart(&mut self, autostart: bool) -> Result<()> {
        self.require_stopped()?;
        self.store.set_autostart(self.vm_id, autostart)
    }

    fn do_is_running(&mut self) -> Result<bool> {
        Ok(self.store.get_vm(self.vm_id)?.status == Status::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NicModel;
    use crate::store::Store;

    fn insert_vm(store: &Store, name: &str, nics: Vec<NicDescription>) -> i64 {
        let desc = crate::model::VmDescription {
            name: name.to_string(),
            hardware: HardwareDescription {
                ram_m: 128,
                cpus: 1,
                boot: 'd',
                rtc_utc: true,
                nics,
                media: vec![],
            },
            autostart: false,
        };
        store.insert_vm(&desc).unwrap()
    }

    /// A `Supervisor` constructed directly (no thread, no command queue) so
    /// its precondition checks and handlers can be exercised synchronously.
    fn bare_supervisor(vm_id: i64, store: Store, ip_path: &str) -> Supervisor {
        let (self_tx, _self_rx) = channel();
        Supervisor {
            vm_id,
            store,
            tap_manager: TapManager::new(ip_path),
            qemu_path: "/nonexistent/qemu-system-x86_64".into(),
            socket_dir: std::env::temp_dir(),
            self_tx,
            process: None,
            qmp: None,
            taps: Vec::new(),
            killed_by_us: false,
            stopping_deadline: None,
        }
    }

    #[test]
    fn do_start_fails_with_vmrunning_when_process_already_alive() {
        let store = Store::open_in_memory().unwrap();
        let vm_id = insert_vm(&store, "demo", vec![]);
        let mut sup = bare_supervisor(vm_id, store, "/bin/true");
        // Stand in for "a QEMU child is already running" without actually
        // spawning one: any live PID satisfies `is_process_alive`.
        sup.process = Some(QemuProcess::from_pid(std::process::id() as i32));

        let result = sup.do_start();
        assert!(matches!(result, Err(Error::VmRunning)));
    }

    #[test]
    fn do_start_rolls_back_taps_and_reverts_status_when_tap_creation_fails() {
        let store = Store::open_in_memory().unwrap();
        let nic = NicDescription {
            model: NicModel::VirtioNet,
            mac: "52:54:00:12:34:56".into(),
            master: "br0".into(),
            mtu: 1500,
        };
        let vm_id = insert_vm(&store, "demo", vec![nic]);
        // No `ip` binary at this path, so `TapManager::create` fails on the
        // very first NIC (spec.md §4.1 "leaves no device").
        let mut sup = bare_supervisor(vm_id, store.clone(), "/nonexistent/ip");

        let result = sup.do_start();

        assert!(matches!(result, Err(Error::HostNetworkError(_))));
        assert!(sup.taps.is_empty());
        assert!(sup.process.is_none());
        assert_eq!(store.get_vm(vm_id).unwrap().status, Status::Stopped);
    }

    #[test]
    fn teardown_failed_start_kills_process_and_reverts_status() {
        let store = Store::open_in_memory().unwrap();
        let vm_id = insert_vm(&store, "demo", vec![]);
        store.update_status(vm_id, Status::Starting).unwrap();

        let mut sup = bare_supervisor(vm_id, store.clone(), "/bin/true");
        let process = QemuProcess::spawn("/bin/sleep", &["5".into()]).unwrap();
        store.update_pid(vm_id, Some(process.pid())).unwrap();
        sup.process = Some(process);

        sup.teardown_failed_start();

        assert!(sup.process.is_none());
        let vm = store.get_vm(vm_id).unwrap();
        assert_eq!(vm.status, Status::Stopped);
        assert!(vm.pid.is_none());
    }

    #[test]
    fn qmp_negotiation_failed_command_drives_starting_to_stopped() {
        let store = Store::open_in_memory().unwrap();
        let vm_id = insert_vm(&store, "demo", vec![]);
        store.update_status(vm_id, Status::Starting).unwrap();

        let mut sup = bare_supervisor(vm_id, store.clone(), "/bin/true");
        sup.dispatch(Command::QmpNegotiationFailed("handshake timed out".into()));

        assert_eq!(store.get_vm(vm_id).unwrap().status, Status::Stopped);
    }

    #[test]
    fn hot_modify_requires_stopped_status() {
        let store = Store::open_in_memory().unwrap();
        let vm_id = insert_vm(&store, "demo", vec![]);
        store.update_status(vm_id, Status::Running).unwrap();

        let mut sup = bare_supervisor(vm_id, store, "/bin/true");
        let result = sup.do_set_autostart(true);

        assert!(matches!(result, Err(Error::VmRunning)));
    }
}
