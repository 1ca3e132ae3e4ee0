use ds::Priority;
use kameo::message::{Context, Message};
use uuid::Uuid;

use crate::{
    error::TerminalError,
    protocol::{Content, EntityId, MessageRef},
    queue::DeliveryStatus,
    state_machine::SessionState,
    terminal::Terminal,
};

#[derive(Debug)]
pub struct Connect {
    pub host: String,
    pub port: u16,
}

impl Message<Connect> for Terminal {
    type Reply = Result<Uuid, TerminalError>;

    async fn handle(&mut self, msg: Connect, _ctx: Context<'_, Self, Self::Reply>) -> Self::Reply {
        let session = self.connect(&msg.host, msg.port).await?;
        Ok(session.id())
    }
}

#[derive(Debug)]
pub struct Login {
    pub identity: Option<EntityId>,
}

impl Message<Login> for Terminal {
    type Reply = Result<bool, TerminalError>;

    async fn handle(&mut self, msg: Login, _ctx: Context<'_, Self, Self::Reply>) -> Self::Reply {
        self.login(msg.identity)
    }
}

#[derive(Debug)]
pub struct EnterBackground;

impl Message<EnterBackground> for Terminal {
    type Reply = Result<(), TerminalError>;

    async fn handle(
        &mut self,
        _msg: EnterBackground,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.enter_background().await
    }
}

#[derive(Debug)]
pub struct EnterForeground;

impl Message<EnterForeground> for Terminal {
    type Reply = Result<(), TerminalError>;

    async fn handle(
        &mut self,
        _msg: EnterForeground,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.enter_foreground().await
    }
}

#[derive(Debug)]
pub struct SendContent {
    pub content: Content,
    pub sender: Option<EntityId>,
    pub receiver: EntityId,
    pub priority: Priority,
}

impl Message<SendContent> for Terminal {
    type Reply = Result<Option<MessageRef>, TerminalError>;

    async fn handle(
        &mut self,
        msg: SendContent,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.send(msg.content, msg.sender.as_ref(), &msg.receiver, msg.priority)
    }
}

#[derive(Debug)]
pub struct GroupInvite {
    pub group: EntityId,
    pub members: Vec<EntityId>,
}

impl Message<GroupInvite> for Terminal {
    type Reply = Result<bool, TerminalError>;

    async fn handle(
        &mut self,
        msg: GroupInvite,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.group_invite(&msg.group, &msg.members)
    }
}

#[derive(Debug)]
pub struct GroupExpel {
    pub group: EntityId,
    pub members: Vec<EntityId>,
}

impl Message<GroupExpel> for Terminal {
    type Reply = Result<bool, TerminalError>;

    async fn handle(
        &mut self,
        msg: GroupExpel,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.group_expel(&msg.group, &msg.members)
    }
}

#[derive(Debug)]
pub struct GroupQuit {
    pub group: EntityId,
}

impl Message<GroupQuit> for Terminal {
    type Reply = Result<bool, TerminalError>;

    async fn handle(&mut self, msg: GroupQuit, _ctx: Context<'_, Self, Self::Reply>) -> Self::Reply {
        self.group_quit(&msg.group)
    }
}

#[derive(Debug)]
pub struct GroupQuery {
    pub group: EntityId,
}

impl Message<GroupQuery> for Terminal {
    type Reply = Result<bool, TerminalError>;

    async fn handle(
        &mut self,
        msg: GroupQuery,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.group_query(&msg.group)
    }
}

#[derive(Debug)]
pub struct CheckDelivery {
    pub message: MessageRef,
}

impl Message<CheckDelivery> for Terminal {
    type Reply = Result<Option<DeliveryStatus>, TerminalError>;

    async fn handle(
        &mut self,
        msg: CheckDelivery,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.delivery_status(&msg.message))
    }
}

#[derive(Debug)]
pub struct ResetSession;

impl Message<ResetSession> for Terminal {
    type Reply = Result<(), TerminalError>;

    async fn handle(
        &mut self,
        _msg: ResetSession,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.reset_session()
    }
}

#[derive(Debug)]
pub struct Disconnect;

impl Message<Disconnect> for Terminal {
    type Reply = Result<(), TerminalError>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.stop().await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct CurrentState;

impl Message<CurrentState> for Terminal {
    type Reply = Result<Option<SessionState>, TerminalError>;

    async fn handle(
        &mut self,
        _msg: CurrentState,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state())
    }
}
