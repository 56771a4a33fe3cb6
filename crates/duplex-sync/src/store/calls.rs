//! 通话状态机
//!
//! 同一时刻至多一个活动通话。状态流转：
//! pending（去电等待）/ ringing（来电振铃）→ accepted → ended，
//! declined / failed 为终态。进入终态的通话在同一次写锁内
//! 归档到最近通话（环形，默认保留 10 条）并清空活动位。

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MessagingStore, Permission, StoreState};
use crate::entities::{Call, CallStatus, CallType, UserRef};
use crate::events::StoreEvent;

/// 来电处理结果
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// 接入振铃
    Ringing(Call),
    /// 已在通话中，该来电应回以 declined（忙线）
    Busy(Call),
    /// 重复或无效来电，忽略
    Ignored,
}

/// 状态机合法转移表
fn call_can_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Pending, Accepted)
            | (Pending, Declined)
            | (Pending, Ended)
            | (Pending, Failed)
            | (Ringing, Accepted)
            | (Ringing, Declined)
            | (Ringing, Ended)
            | (Ringing, Failed)
            | (Accepted, Ended)
            | (Accepted, Failed)
    )
}

impl MessagingStore {
    pub fn active_call(&self) -> Option<Call> {
        self.state.read().active_call.clone()
    }

    /// 最近通话，新的在前
    pub fn recent_calls(&self) -> Vec<Call> {
        self.state.read().recent_calls.iter().cloned().collect()
    }

    /// 发起去电（乐观：本地先置 pending，引擎随后上行 call_request）
    pub fn start_call(
        &self,
        callee: UserRef,
        call_type: CallType,
    ) -> std::result::Result<Call, Permission> {
        let permission = self.can_call(&callee.id);
        if !permission.allowed {
            return Err(permission);
        }

        let call = {
            let mut state = self.state.write();
            // can_call 与写锁之间的竞态兜底
            if state.active_call.is_some() {
                return Err(Permission::deny("当前已在通话中"));
            }
            let me = UserRef::new(self.current_user_id(), "", "");
            let call = Call {
                id: Uuid::new_v4().to_string(),
                caller: me,
                callee,
                call_type,
                status: CallStatus::Pending,
                started_at: None,
                ended_at: None,
                duration_secs: None,
                created_at: Utc::now(),
            };
            state.active_call = Some(call.clone());
            call
        };

        info!("📞 发起通话: id={} callee={}", call.id, call.callee.id);
        self.emit(StoreEvent::CallStateChanged {
            call_id: call.id.clone(),
            old_status: None,
            new_status: CallStatus::Pending,
            call: call.clone(),
        });
        Ok(call)
    }

    /// 来电入库
    ///
    /// 已有活动通话时返回 [`CallOutcome::Busy`]，由引擎代发拒接；
    /// 重复来电（同 ID）直接忽略。
    pub fn apply_incoming_call(&self, mut call: Call) -> CallOutcome {
        let outcome = {
            let mut state = self.state.write();
            if let Some(active) = &state.active_call {
                if active.id == call.id {
                    return CallOutcome::Ignored;
                }
                debug!("忙线，来电 {} 将被拒接", call.id);
                return CallOutcome::Busy(call);
            }
            call.status = CallStatus::Ringing;
            state.active_call = Some(call.clone());
            CallOutcome::Ringing(call)
        };

        if let CallOutcome::Ringing(call) = &outcome {
            info!("📞 来电振铃: id={} caller={}", call.id, call.caller.id);
            self.emit(StoreEvent::CallStateChanged {
                call_id: call.id.clone(),
                old_status: None,
                new_status: CallStatus::Ringing,
                call: call.clone(),
            });
        }
        outcome
    }

    /// 服务端确认去电：临时 uuid 替换为服务端通话 ID
    pub fn confirm_call(&self, local_id: &str, server_id: &str) -> bool {
        let mut state = self.state.write();
        match state.active_call.as_mut() {
            Some(call) if call.id == local_id => {
                call.id = server_id.to_string();
                true
            }
            _ => false,
        }
    }

    /// 本地接听来电
    pub fn accept_call(&self, call_id: &str) -> Option<Call> {
        self.transition_call(call_id, CallStatus::Accepted, None)
    }

    /// 本地拒接来电
    pub fn decline_call(&self, call_id: &str) -> Option<Call> {
        self.transition_call(call_id, CallStatus::Declined, None)
    }

    /// 远端对我方去电的应答
    pub fn apply_call_response(&self, call_id: &str, accepted: bool) -> Option<Call> {
        let target = if accepted {
            CallStatus::Accepted
        } else {
            CallStatus::Declined
        };
        self.transition_call(call_id, target, None)
    }

    /// 挂断（本地或远端，语义一致）
    ///
    /// duration 缺省时按 started_at 到现在计算。
    pub fn end_call(&self, call_id: &str, duration: Option<u64>) -> Option<Call> {
        self.transition_call(call_id, CallStatus::Ended, duration)
    }

    /// 通话失败（信令超时、对端掉线）
    pub fn fail_call(&self, call_id: &str, reason: &str) -> Option<Call> {
        warn!("通话失败: id={} reason={}", call_id, reason);
        self.transition_call(call_id, CallStatus::Failed, None)
    }

    /// 状态机推进；非法转移视为无操作
    fn transition_call(
        &self,
        call_id: &str,
        target: CallStatus,
        duration: Option<u64>,
    ) -> Option<Call> {
        let (call, old_status) = {
            let mut state = self.state.write();
            let active = state.active_call.as_mut()?;
            if active.id != call_id {
                debug!("忽略对非活动通话的操作: {}", call_id);
                return None;
            }
            let old_status = active.status;
            if !call_can_transition(old_status, target) {
                debug!("忽略非法通话转移: {:?} -> {:?}", old_status, target);
                return None;
            }

            let now = Utc::now();
            active.status = target;
            match target {
                CallStatus::Accepted => {
                    active.started_at = Some(now);
                }
                CallStatus::Ended | CallStatus::Declined | CallStatus::Failed => {
                    active.ended_at = Some(now);
                    if target == CallStatus::Ended {
                        active.duration_secs =
                            duration.or_else(|| Some(active.duration_until(now)));
                    }
                }
                _ => {}
            }
            let call = active.clone();

            // 终态：先归档再清空活动位，同一写锁内完成
            if target.is_terminal() {
                let archived = state.active_call.take();
                if let Some(archived) = archived {
                    Self::archive_call_locked(
                        &mut state,
                        archived,
                        self.config.recent_calls_capacity,
                    );
                }
            }
            (call, old_status)
        };

        self.emit(StoreEvent::CallStateChanged {
            call_id: call.id.clone(),
            old_status: Some(old_status),
            new_status: target,
            call: call.clone(),
        });
        Some(call)
    }

    /// 归档到最近通话（调用方持有写锁）
    pub(crate) fn archive_call_locked(state: &mut StoreState, call: Call, capacity: usize) {
        state.recent_calls.push_front(call);
        while state.recent_calls.len() > capacity {
            state.recent_calls.pop_back();
        }
    }
}
