use std::fmt;

use parking_lot::Mutex;

/// 会话状态。
///
/// ```text
/// New ──▶ Enabled ──▶ Closing ──▶ Closed
///   │        └────────────────────▲  ▲
///   └────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    Enabled,
    Closing,
    Closed,
}

impl SessionState {
    /// 判断迁移是否合法；同态迁移一律视为非法。
    pub const fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::New, SessionState::Enabled)
                | (SessionState::New, SessionState::Closed)
                | (SessionState::Enabled, SessionState::Closing)
                | (SessionState::Enabled, SessionState::Closed)
                | (SessionState::Closing, SessionState::Closed)
        )
    }

    /// `Closing` 与 `Closed` 都是终态区间：不再接受新的业务写入。
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::New => "new",
            SessionState::Enabled => "enabled",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// 一次迁移请求的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// 迁移生效，调用方赢得了该迁移并负责其副作用。
    Applied { from: SessionState },
    /// 迁移被拒绝，状态保持不变。
    Ignored { current: SessionState },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// 会话状态的唯一持有者，所有迁移都经过 [`SessionStateCell::advance`]。
///
/// # 契约说明（What）
/// - `advance` 在互斥锁内完成“检查 + 写入”，并发调用中恰有一方得到 `Applied`；
/// - 到达 `Closed` 后任何迁移都被忽略，因此关闭副作用（缓冲归还、通道关闭、
///   `SessionClosed` 事件）只会由赢得迁移的线程执行一次。
#[derive(Debug)]
pub struct SessionStateCell {
    state: Mutex<SessionState>,
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::New),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn advance(&self, target: SessionState) -> Transition {
        let mut state = self.state.lock();
        let current = *state;
        if current.can_transition_to(target) {
            *state = target;
            Transition::Applied { from: current }
        } else {
            Transition::Ignored { current }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_absorbing() {
        let cell = SessionStateCell::new();
        assert!(cell.advance(SessionState::Enabled).is_applied());
        assert!(cell.advance(SessionState::Closed).is_applied());
        for target in [
            SessionState::New,
            SessionState::Enabled,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert_eq!(
                cell.advance(target),
                Transition::Ignored {
                    current: SessionState::Closed
                }
            );
        }
    }

    #[test]
    fn closing_only_moves_to_closed() {
        let cell = SessionStateCell::new();
        cell.advance(SessionState::Enabled);
        assert_eq!(
            cell.advance(SessionState::Closing),
            Transition::Applied {
                from: SessionState::Enabled
            }
        );
        assert!(!cell.advance(SessionState::Enabled).is_applied());
        assert!(cell.get().is_terminal());
        assert!(cell.advance(SessionState::Closed).is_applied());
    }
}
