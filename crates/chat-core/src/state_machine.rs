use crate::{
    error::ChatError,
    types::{ChatCommand, ChatEvent, ChatLifecycleState},
};

/// Connection lifecycle: `Cold → Configured → Loading → Live ⇄ Disconnected`.
#[derive(Debug, Clone)]
pub struct ChatStateMachine {
    state: ChatLifecycleState,
}

impl Default for ChatStateMachine {
    fn default() -> Self {
        Self {
            state: ChatLifecycleState::Cold,
        }
    }
}

impl ChatStateMachine {
    pub fn state(&self) -> ChatLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &ChatCommand) -> Result<Vec<ChatEvent>, ChatError> {
        use ChatCommand::*;

        match command {
            Init { .. } => self.transition_from_state(
                ChatLifecycleState::Cold,
                ChatLifecycleState::Configured,
                "init",
            ),
            Connect => self.transition_from_state(
                ChatLifecycleState::Configured,
                ChatLifecycleState::Loading,
                "connect",
            ),
            Reconnect => self.transition_from_state(
                ChatLifecycleState::Disconnected,
                ChatLifecycleState::Loading,
                "reconnect",
            ),
            LoadOlder { .. } => {
                if matches!(
                    self.state,
                    ChatLifecycleState::Live | ChatLifecycleState::Disconnected
                ) {
                    Ok(Vec::new())
                } else {
                    Err(ChatError::invalid_state(self.state, "load_older"))
                }
            }
            RestoreIdentity
            | ResolveCountry
            | SendMessage { .. }
            | EditMessage { .. }
            | DeleteMessage { .. }
            | AddReaction { .. }
            | FetchMessage { .. }
            | TrendingGifs
            | SearchGifs { .. }
            | RequestOtp { .. }
            | VerifyOtp { .. }
            | SetUsername { .. }
            | Logout => {
                if self.state == ChatLifecycleState::Cold {
                    Err(ChatError::invalid_state(self.state, "chat command"))
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Resolve a pending `Connect`/`Reconnect`.
    pub fn on_connect_result(&mut self, success: bool) -> Result<ChatEvent, ChatError> {
        if self.state != ChatLifecycleState::Loading {
            return Err(ChatError::invalid_state(self.state, "on_connect_result"));
        }

        let next = if success {
            ChatLifecycleState::Live
        } else {
            ChatLifecycleState::Disconnected
        };
        self.state = next;
        Ok(ChatEvent::StateChanged { state: next })
    }

    /// The change subscription dropped while live.
    pub fn on_subscription_lost(&mut self) -> Result<ChatEvent, ChatError> {
        if self.state != ChatLifecycleState::Live {
            return Err(ChatError::invalid_state(self.state, "on_subscription_lost"));
        }
        self.state = ChatLifecycleState::Disconnected;
        Ok(ChatEvent::StateChanged {
            state: ChatLifecycleState::Disconnected,
        })
    }

    fn transition_from_state(
        &mut self,
        expected: ChatLifecycleState,
        next: ChatLifecycleState,
        action: &str,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ChatEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ChatStateMachine {
        let mut sm = ChatStateMachine::default();
        sm.apply(&ChatCommand::Init { config: None })
            .expect("init must work");
        sm
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = configured();
        assert_eq!(sm.state(), ChatLifecycleState::Configured);

        sm.apply(&ChatCommand::Connect).expect("connect must work");
        assert_eq!(sm.state(), ChatLifecycleState::Loading);

        sm.on_connect_result(true).expect("connect should resolve");
        assert_eq!(sm.state(), ChatLifecycleState::Live);

        sm.on_subscription_lost().expect("drop should be accepted");
        assert_eq!(sm.state(), ChatLifecycleState::Disconnected);

        sm.apply(&ChatCommand::Reconnect)
            .expect("reconnect should work");
        assert_eq!(sm.state(), ChatLifecycleState::Loading);
    }

    #[test]
    fn failed_connect_allows_manual_reconnect() {
        let mut sm = configured();
        sm.apply(&ChatCommand::Connect).expect("connect must work");
        let event = sm.on_connect_result(false).expect("failure resolves");
        assert_eq!(
            event,
            ChatEvent::StateChanged {
                state: ChatLifecycleState::Disconnected
            }
        );
        sm.apply(&ChatCommand::Reconnect)
            .expect("reconnect after failure");
    }

    #[test]
    fn rejects_commands_before_init() {
        let mut sm = ChatStateMachine::default();
        let err = sm
            .apply(&ChatCommand::TrendingGifs)
            .expect_err("gif search needs init");
        assert_eq!(err.code, "invalid_state_transition");

        let err = sm
            .apply(&ChatCommand::Connect)
            .expect_err("connect needs init");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_pagination_before_initial_load() {
        let mut sm = configured();
        let err = sm
            .apply(&ChatCommand::LoadOlder {
                before: 10,
                limit: 50,
            })
            .expect_err("pagination needs an initial page");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_reconnect_while_live() {
        let mut sm = configured();
        sm.apply(&ChatCommand::Connect).expect("connect");
        sm.on_connect_result(true).expect("live");
        let err = sm
            .apply(&ChatCommand::Reconnect)
            .expect_err("already live");
        assert_eq!(err.code, "invalid_state_transition");
    }
}
