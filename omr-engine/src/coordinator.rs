use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use omr_core::sheet::{SheetInput, SystemId};
use omr_core::structure::{BuildReport, SheetStructure};
use tracing::{debug, error, info, warn};

use crate::boundaries::{BoundaryEdit, BoundaryLayout, apply_edit};
use crate::builder::StructureBuilder;
use crate::errors::EngineError;
use crate::partition::EntityPartitioner;
use crate::settings::EngineSettings;
use crate::snapshot::SnapshotCell;

/// 一次结构修改完成后的结果。
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildOutcome {
    pub generation: u64,
    pub report: BuildReport,
    /// 图元归属发生变化的系统，供调用方局部刷新。
    pub touched: BTreeSet<SystemId>,
}

impl RebuildOutcome {
    fn new(structure: &SheetStructure, touched: BTreeSet<SystemId>) -> Self {
        Self {
            generation: structure.generation(),
            report: structure.report(),
            touched,
        }
    }

    /// 形如 `[#1#3]` 的受影响系统列表。
    pub fn touched_label(&self) -> String {
        touched_label(&self.touched)
    }
}

fn touched_label(touched: &BTreeSet<SystemId>) -> String {
    let ids: String = touched.iter().map(SystemId::to_string).collect();
    format!("[{ids}]")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    /// 结构构建步骤，失败上报为步骤失败。
    BuildSystems,
    /// 识别重跑或设置变化后的重建，失败时记录并保留上一代结构。
    RebuildAll,
}

type Reply = Sender<Result<RebuildOutcome, EngineError>>;

enum Job {
    Rebuild {
        kind: RebuildKind,
        input: Option<SheetInput>,
        reply: Reply,
    },
    EditBoundary {
        edit: BoundaryEdit,
        reply: Reply,
    },
}

/// 已提交修改的完成通知。
#[must_use = "the rebuild result is only observable through this handle"]
pub struct PendingRebuild {
    sheet: u32,
    receiver: Receiver<Result<RebuildOutcome, EngineError>>,
}

impl PendingRebuild {
    /// 阻塞直到该修改执行完毕。
    pub fn wait(self) -> Result<RebuildOutcome, EngineError> {
        self.receiver
            .recv()
            .map_err(|_| EngineError::WorkerStopped(self.sheet))?
    }

    /// 非阻塞查询，尚未完成时返回 `None`。
    pub fn try_wait(&self) -> Option<Result<RebuildOutcome, EngineError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::WorkerStopped(self.sheet))),
        }
    }
}

/// 单页结构的唯一写入者：所有修改进入有界队列，由专属线程按提交顺序逐个执行。
pub struct RebuildCoordinator {
    sheet_number: u32,
    cell: Arc<SnapshotCell>,
    sender: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl RebuildCoordinator {
    pub fn spawn(input: SheetInput, settings: EngineSettings) -> Result<Self, EngineError> {
        let sheet_number = input.number;
        let cell = Arc::new(SnapshotCell::new(SheetStructure::unbuilt(Arc::new(input))));
        let (sender, receiver) = mpsc::sync_channel(settings.queue_capacity.max(1));

        let worker_cell = Arc::clone(&cell);
        let worker = thread::Builder::new()
            .name(format!("sheet-{sheet_number}"))
            .spawn(move || worker_loop(sheet_number, receiver, worker_cell, settings))
            .map_err(|source| EngineError::WorkerSpawn {
                sheet: sheet_number,
                source,
            })?;
        debug!(sheet = sheet_number, "结构工作线程已启动");

        Ok(Self {
            sheet_number,
            cell,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn sheet_number(&self) -> u32 {
        self.sheet_number
    }

    /// 最近一次发布的结构，读取无需等待队列。
    pub fn snapshot(&self) -> Result<Arc<SheetStructure>, EngineError> {
        self.cell.load()
    }

    pub fn build_systems(&self) -> Result<PendingRebuild, EngineError> {
        self.submit(|reply| Job::Rebuild {
            kind: RebuildKind::BuildSystems,
            input: None,
            reply,
        })
    }

    /// 传入新的检测结果表示识别已重跑；为空时沿用当前输入。
    pub fn rebuild_all(&self, input: Option<SheetInput>) -> Result<PendingRebuild, EngineError> {
        self.submit(|reply| Job::Rebuild {
            kind: RebuildKind::RebuildAll,
            input,
            reply,
        })
    }

    pub fn apply_boundary_edit(&self, edit: BoundaryEdit) -> Result<PendingRebuild, EngineError> {
        self.submit(|reply| Job::EditBoundary { edit, reply })
    }

    fn submit(&self, make: impl FnOnce(Reply) -> Job) -> Result<PendingRebuild, EngineError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(EngineError::WorkerStopped(self.sheet_number))?;
        let (reply, receiver) = mpsc::channel();
        sender
            .send(make(reply))
            .map_err(|_| EngineError::WorkerStopped(self.sheet_number))?;
        Ok(PendingRebuild {
            sheet: self.sheet_number,
            receiver,
        })
    }
}

impl Drop for RebuildCoordinator {
    fn drop(&mut self) {
        // 关闭队列后，工作线程处理完剩余任务即退出
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(sheet = self.sheet_number, "结构工作线程异常退出");
            }
        }
    }
}

fn worker_loop(
    sheet_number: u32,
    receiver: Receiver<Job>,
    cell: Arc<SnapshotCell>,
    settings: EngineSettings,
) {
    for job in receiver {
        match job {
            Job::Rebuild { kind, input, reply } => {
                let result =
                    contained(sheet_number, || run_rebuild(&cell, kind, input, &settings));
                let _ = reply.send(result);
            }
            Job::EditBoundary { edit, reply } => {
                let result = contained(sheet_number, || run_boundary_edit(&cell, &edit));
                let _ = reply.send(result);
            }
        }
    }
    debug!(sheet = sheet_number, "结构工作线程退出");
}

/// 单个任务内的 panic 转为错误回复，工作线程继续处理后续任务。
fn contained(
    sheet_number: u32,
    job: impl FnOnce() -> Result<RebuildOutcome, EngineError>,
) -> Result<RebuildOutcome, EngineError> {
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let reason = panic_reason(payload.as_ref());
        error!(sheet = sheet_number, reason = %reason, "结构任务异常中止，保留当前结构");
        Err(EngineError::JobPanicked {
            sheet: sheet_number,
            reason,
        })
    })
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| reason.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn run_rebuild(
    cell: &SnapshotCell,
    kind: RebuildKind,
    input: Option<SheetInput>,
    settings: &EngineSettings,
) -> Result<RebuildOutcome, EngineError> {
    let previous = cell.load()?;
    let input = input
        .map(Arc::new)
        .unwrap_or_else(|| Arc::clone(previous.input()));

    match rebuild(&previous, input, settings) {
        Ok((next, touched)) => {
            let published = cell.publish(next)?;
            if published.report().no_system_found() {
                info!(sheet = published.sheet_number(), "no system found");
            }
            Ok(RebuildOutcome::new(&published, touched))
        }
        Err(err) => {
            match kind {
                RebuildKind::BuildSystems => {
                    error!(sheet = previous.sheet_number(), error = %err, "构建系统失败");
                }
                RebuildKind::RebuildAll => {
                    warn!(
                        sheet = previous.sheet_number(),
                        generation = previous.generation(),
                        error = %err,
                        "Error rebuilding systems info，保留上一代结构"
                    );
                }
            }
            Err(err)
        }
    }
}

fn run_boundary_edit(
    cell: &SnapshotCell,
    edit: &BoundaryEdit,
) -> Result<RebuildOutcome, EngineError> {
    let previous = cell.load()?;
    let (next, touched) = repartition(&previous, edit)?;
    let published = cell.publish(next)?;
    Ok(RebuildOutcome::new(&published, touched))
}

/// 完整重建：划分声部、计算边界、分配图元，得到新一代结构及受影响的系统。
pub fn rebuild(
    previous: &SheetStructure,
    input: Arc<SheetInput>,
    settings: &EngineSettings,
) -> Result<(SheetStructure, BTreeSet<SystemId>), EngineError> {
    if input.number != previous.sheet_number() {
        return Err(EngineError::InvalidInput(format!(
            "input of sheet {} submitted to sheet {}",
            input.number,
            previous.sheet_number()
        )));
    }
    let built = StructureBuilder::new(&input).build()?;
    let boundaries =
        BoundaryLayout::new(&input, &built.systems, settings).compute(previous.boundaries());
    let partition =
        EntityPartitioner::new(&built.systems, &boundaries).partition(&input.primitives);
    let touched = partition.touched_since(previous.partition());

    let next = SheetStructure::new(
        previous.generation() + 1,
        input,
        built.systems,
        boundaries,
        partition,
    );
    Ok((next, touched))
}

/// 边界修改后的增量路径：只重新分配图元。
pub fn repartition(
    previous: &SheetStructure,
    edit: &BoundaryEdit,
) -> Result<(SheetStructure, BTreeSet<SystemId>), EngineError> {
    if !previous.is_built() {
        return Err(EngineError::NotBuilt(previous.sheet_number()));
    }
    let boundaries = apply_edit(previous, edit)?;
    let partition = EntityPartitioner::new(previous.systems(), &boundaries)
        .partition(&previous.input().primitives);
    let touched = partition.touched_since(previous.partition());
    if !touched.is_empty() {
        debug!(
            sheet = previous.sheet_number(),
            "Impacted systems: {}",
            touched_label(&touched)
        );
    }

    let next = SheetStructure::new(
        previous.generation() + 1,
        Arc::clone(previous.input()),
        previous.systems().to_vec(),
        boundaries,
        partition,
    );
    Ok((next, touched))
}
