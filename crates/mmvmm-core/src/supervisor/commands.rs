use crate::error::Result;
use crate::model::{HardwareDescription, MediaDescription, NicDescription, Vm};
use tokio::sync::oneshot;

/// One-shot reply channel threaded through a command. `tokio::sync::oneshot`
/// is used even though the supervisor loop itself is a plain OS thread:
/// `Sender::send` is a synchronous, non-blocking call, so it costs nothing
/// to use from outside an async context while still letting an async RPC
/// handler `.await` the `Receiver` without blocking its executor thread.
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands accepted by one VM's event loop (spec.md §4.4).
///
/// External variants originate from RPC dispatch; Qmp* variants originate
/// from that VM's QMP monitor worker thread; `Stop` is the loop's own exit
/// sentinel.
pub enum Command {
    Start(Reply<()>),
    PowerOff(Reply<()>),
    Reset(Reply<()>),
    Terminate { kill: bool, reply: Reply<()> },
    /// Additive relative to spec.md's original external taxonomy — restores
    /// the orthogonal QMP `stop`/`cont` passthrough from the original
    /// implementation without touching Status (see SPEC_FULL.md supplement).
    Pause(Reply<()>),
    Resume(Reply<()>),

    AddNic { desc: NicDescription, reply: Reply<i64> },
    DelNic { nic_id: i64, reply: Reply<()> },
    AddMedia { desc: MediaDescription, reply: Reply<i64> },
    DelMedia { media_id: i64, reply: Reply<()> },
    UpdateHardware { desc: HardwareDescription, reply: Reply<()> },
    SetAutostart { autostart: bool, reply: Reply<()> },

    Info(Reply<Vm>),
    IsRunning(Reply<bool>),

    QmpShutdown,
    QmpNegotiationComplete,
    QmpNegotiationFailed(String),
    QmpConnectionLost(String),

    Stop,
}
