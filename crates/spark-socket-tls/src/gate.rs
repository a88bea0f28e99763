use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Handle, RuntimeFlavor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Failed,
}

/// 握手闸门：握手完成前发起的读写在条件变量上等待，而不是忙轮询。
///
/// # 契约（What）
/// - `open`/`fail` 只生效一次，之后状态不再变化；
/// - `wait` 返回 `true` 表示握手成功，`false` 表示握手失败或通道已关闭；
/// - 在 Tokio 多线程运行时的工作线程上等待时使用 `block_in_place`，
///   让出该线程上的其他任务（包括握手任务本身）。
#[derive(Debug)]
pub struct HandshakeGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn open(&self) {
        self.settle(GateState::Open);
    }

    pub fn fail(&self) {
        self.settle(GateState::Failed);
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == GateState::Open
    }

    pub fn is_settled(&self) -> bool {
        *self.state.lock() != GateState::Pending
    }

    pub fn wait(&self) -> bool {
        {
            let state = self.state.lock();
            if *state != GateState::Pending {
                return *state == GateState::Open;
            }
        }
        tracing::debug!("waiting for tls handshake");
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.wait_blocking())
            }
            _ => self.wait_blocking(),
        }
    }

    fn wait_blocking(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Pending {
            self.changed.wait(&mut state);
        }
        *state == GateState::Open
    }

    fn settle(&self, next: GateState) {
        let mut state = self.state.lock();
        if *state == GateState::Pending {
            *state = next;
            self.changed.notify_all();
        }
    }
}
