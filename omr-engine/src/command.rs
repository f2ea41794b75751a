use std::collections::HashMap;

use omr_core::geometry::Point2;

use crate::boundaries::BoundaryEdit;
use crate::coordinator::{PendingRebuild, RebuildCoordinator};
use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    /// 按空白切分一行命令文本，首个单词为命令名。
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let name = words.next()?.to_string();
        Some(Self {
            name,
            args: words.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub coordinator: &'a RebuildCoordinator,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(BuildSystemsCommand);
        bus.register(RebuildAllCommand);
        bus.register(EditBoundaryCommand);
        bus.register(ReportCommand);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

/// 等待提交的修改完成并生成回复。
fn finish(pending: Result<PendingRebuild, EngineError>, done: &str) -> CommandResponse {
    match pending.and_then(PendingRebuild::wait) {
        Ok(outcome) => CommandResponse::ok(format!(
            "{done}: {}（第 {} 代，受影响系统 {}）",
            outcome.report,
            outcome.generation,
            outcome.touched_label()
        )),
        Err(err) => CommandResponse::err(err.to_string()),
    }
}

struct BuildSystemsCommand;

impl CommandHandler for BuildSystemsCommand {
    fn name(&self) -> &'static str {
        "build_systems"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        finish(context.coordinator.build_systems(), "系统已构建")
    }
}

struct RebuildAllCommand;

impl CommandHandler for RebuildAllCommand {
    fn name(&self) -> &'static str {
        "rebuild_all"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        finish(context.coordinator.rebuild_all(None), "系统已重建")
    }
}

/// `edit_boundary <id> <x,y> <x,y> ...`
struct EditBoundaryCommand;

impl EditBoundaryCommand {
    fn parse(request: &CommandRequest) -> Result<BoundaryEdit, String> {
        let (id, points) = request
            .args
            .split_first()
            .ok_or_else(|| "用法: edit_boundary <id> <x,y>...".to_string())?;
        let id: u32 = id.parse().map_err(|_| format!("无效的边界编号: {id}"))?;
        let points = points
            .iter()
            .map(|raw| parse_point(raw).ok_or_else(|| format!("无效的控制点: {raw}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BoundaryEdit::new(id, points))
    }
}

fn parse_point(raw: &str) -> Option<Point2> {
    let (x, y) = raw.split_once(',')?;
    Some(Point2::new(x.trim().parse().ok()?, y.trim().parse().ok()?))
}

impl CommandHandler for EditBoundaryCommand {
    fn name(&self) -> &'static str {
        "edit_boundary"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        match Self::parse(request) {
            Ok(edit) => finish(context.coordinator.apply_boundary_edit(edit), "边界已更新"),
            Err(message) => CommandResponse::err(message),
        }
    }
}

struct ReportCommand;

impl CommandHandler for ReportCommand {
    fn name(&self) -> &'static str {
        "report"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let snapshot = match context.coordinator.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => return CommandResponse::err(err.to_string()),
        };
        if !snapshot.is_built() {
            return CommandResponse::err(
                EngineError::NotBuilt(snapshot.sheet_number()).to_string(),
            );
        }
        let mut lines = vec![format!(
            "页面 {}：{}（第 {} 代）",
            snapshot.sheet_number(),
            snapshot.report(),
            snapshot.generation()
        )];
        for system in snapshot.systems() {
            lines.push(format!(
                "  系统 {}：{} 个声部，{} 行谱表，{} 个图元",
                system.id(),
                system.parts().len(),
                system.staves().count(),
                snapshot.partition().primitives_of(system.id()).len()
            ));
        }
        CommandResponse::ok(lines.join("\n"))
    }
}
