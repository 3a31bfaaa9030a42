//! 运行状态机
//!
//! Collecting → Capturing → Analyzing → Aggregating → Done，
//! 任何未结束的状态都可以直接进入 Aborted。状态只进不退。

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::utils::logging::log_state_transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Collecting,
    Capturing,
    Analyzing,
    Aggregating,
    Done,
    Aborted,
}

impl RunState {
    fn rank(self) -> u8 {
        match self {
            RunState::Collecting => 0,
            RunState::Capturing => 1,
            RunState::Analyzing => 2,
            RunState::Aggregating => 3,
            RunState::Done | RunState::Aborted => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }

    /// 允许向前跳过中间状态（例如没有任何 URL 时直接 Done）
    pub fn can_transition_to(self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RunState::Aborted || next.rank() > self.rank()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Collecting => "收集 URL",
            RunState::Capturing => "截图",
            RunState::Analyzing => "评分",
            RunState::Aggregating => "汇总",
            RunState::Done => "完成",
            RunState::Aborted => "已中止",
        };
        f.write_str(s)
    }
}

/// 记录当前状态，非法转换只记日志不生效
#[derive(Debug)]
pub struct RunStateMachine {
    run_id: String,
    state: RunState,
}

impl RunStateMachine {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Collecting,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "[运行 {}] 忽略非法状态转换: {} → {}",
                self.run_id, self.state, next
            );
            return false;
        }
        log_state_transition(&self.run_id, self.state, next);
        self.state = next;
        true
    }
}
