use std::env;
use std::path::PathBuf;

use omr_config::AppConfig;
use omr_core::geometry::{Point2, Vector2};
use omr_core::score::{PageRegistry, Score};
use omr_core::sheet::BoundaryId;
use omr_engine::book::Book;
use omr_engine::command::{CommandBus, CommandContext, CommandRequest, CommandResponse};
use omr_io::{BookLinks, JsonFacade, LinksStore};
use tracing::{info, warn};

use crate::errors::FrontendError;
use crate::loader::{SheetSource, engine_settings, load_sheets_from_env_or_demo, score_defaults};

/// 分号分隔的命令脚本，每条形如 `<页码>:<命令> [参数...]`。
const COMMANDS_ENV: &str = "OMR_CLI_COMMANDS";
const LINKS_IN_ENV: &str = "OMR_CLI_LINKS_IN";
const LINKS_OUT_ENV: &str = "OMR_CLI_LINKS_OUT";

/// 简易 CLI 演示：加载页面，并行构建结构，执行编辑命令，组装乐谱并打印概览。
pub fn run_demo(config: &AppConfig) -> Result<(), FrontendError> {
    let loaded = load_sheets_from_env_or_demo(config);
    let mut book = Book::new(engine_settings(config), score_defaults(config));
    for sheet in loaded.sheets {
        book.add_sheet(sheet)?;
    }

    println!("Rust 版 OMR 结构重建演示");
    match &loaded.source {
        SheetSource::Files(paths) => {
            for path in paths {
                println!("已从文件加载页面：{}", path.display());
            }
        }
        SheetSource::Demo => println!("使用内置示例页面"),
    }

    let command_bus = CommandBus::new();
    let mut commands: Vec<&str> = command_bus.available_commands().copied().collect();
    commands.sort_unstable();
    println!("支持的命令: {}", commands.join(", "));

    for (number, outcome) in book.build_all()? {
        match outcome {
            Ok(outcome) => println!("页面 {number}: {}", outcome.report),
            Err(err) => println!("页面 {number}: 构建失败: {err}"),
        }
    }

    let script = match env::var(COMMANDS_ENV) {
        Ok(script) => parse_script(&script),
        Err(_) => demo_script(&book)?,
    };
    for (number, line) in script {
        let response = dispatch_cli_command(&command_bus, &book, number, &line)?;
        let message = response.message.unwrap_or_default();
        if response.success {
            println!("[{number}] {line}\n{message}");
        } else {
            warn!(sheet = number, command = %line, "CLI 命令执行失败: {message}");
            println!("[{number}] {line} 失败: {message}");
        }
    }

    book.assemble_scores()?;
    if let Some(path) = env::var_os(LINKS_IN_ENV).map(PathBuf::from) {
        let links = JsonFacade::new().load_links(&path)?;
        let scores = links.restore(&book, book.defaults());
        info!(path = %path.display(), scores = scores.len(), "已恢复乐谱链接");
        book.replace_scores(scores);
    }

    print_scores(&book)?;

    if let Some(path) = env::var_os(LINKS_OUT_ENV).map(PathBuf::from) {
        JsonFacade::new().save_links(&BookLinks::from_scores(book.scores()), &path)?;
        println!("乐谱链接已写出：{}", path.display());
    }
    Ok(())
}

fn dispatch_cli_command(
    bus: &CommandBus,
    book: &Book,
    number: u32,
    line: &str,
) -> Result<CommandResponse, FrontendError> {
    let Some(request) = CommandRequest::parse(line) else {
        return Ok(CommandResponse::err("空命令"));
    };
    let coordinator = book.coordinator(number)?;
    let mut context = CommandContext { coordinator };
    Ok(bus.dispatch(&request, &mut context))
}

fn parse_script(script: &str) -> Vec<(u32, String)> {
    script
        .split(';')
        .filter_map(|entry| {
            let (number, line) = entry.split_once(':')?;
            match number.trim().parse() {
                Ok(number) => Some((number, line.trim().to_string())),
                Err(_) => {
                    warn!(entry, "忽略无法识别的命令脚本项");
                    None
                }
            }
        })
        .collect()
}

/// 把首页第一条内部边界整体下移 10 像素，再输出各页报告。
fn demo_script(book: &Book) -> Result<Vec<(u32, String)>, FrontendError> {
    let mut script = Vec::new();
    let Some(&first) = book.sheet_numbers().first() else {
        return Ok(script);
    };

    let snapshot = book.coordinator(first)?.snapshot()?;
    if let Some(boundary) = snapshot
        .boundary(BoundaryId::new(1))
        .filter(|_| !snapshot.is_outer_edge(BoundaryId::new(1)))
    {
        let shift = Vector2::new(0.0, 10.0);
        let points: Vec<String> = boundary
            .points()
            .iter()
            .map(|point| format_point(point.translate(shift)))
            .collect();
        script.push((first, format!("edit_boundary 1 {}", points.join(" "))));
    }
    script.extend(
        book.sheet_numbers()
            .into_iter()
            .map(|number| (number, "report".to_string())),
    );
    Ok(script)
}

fn format_point(point: Point2) -> String {
    format!("{:.2},{:.2}", point.x(), point.y())
}

fn print_scores(book: &Book) -> Result<(), FrontendError> {
    println!("共 {} 部乐谱：", book.scores().len());
    for (index, score) in book.scores().iter().enumerate() {
        print_score(book, index + 1, score)?;
    }
    Ok(())
}

fn print_score(book: &Book, id: usize, score: &Score) -> Result<(), FrontendError> {
    println!(
        "  乐谱 {id}: 页面 {:?}，速度={}，音量={}{}",
        score.sheet_numbers(),
        score.tempo(),
        score.volume(),
        if score.has_volume() { "" } else { "（缺省）" }
    );
    for page_ref in score.page_refs() {
        match book.resolve(page_ref) {
            Some(page) => {
                let offset = score.measure_id_offset(page)?;
                let delta = page
                    .delta_measure_id
                    .map_or_else(|| "缺失".to_string(), |delta| delta.to_string());
                println!(
                    "    页 {}/{}：系统 {}..{}，小节数={delta}，小节偏移={offset}",
                    page.sheet_number, page.id, page.first_system, page.last_system
                );
            }
            None => println!(
                "    页 {}/{}：无法解析",
                page_ref.sheet_number, page_ref.id
            ),
        }
    }
    for part in score.logical_parts().unwrap_or_default() {
        println!(
            "    声部 {}：音色={}",
            part.display_name(),
            part.effective_program()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use omr_core::score::ScoreDefaults;
    use omr_engine::demo::demo_sheets;
    use omr_engine::settings::EngineSettings;

    use super::*;

    fn built_book() -> Book {
        let mut book = Book::new(EngineSettings::default(), ScoreDefaults::default());
        for sheet in demo_sheets() {
            book.add_sheet(sheet).expect("add sheet");
        }
        book.build_all().expect("build");
        book
    }

    #[test]
    fn script_entries_need_a_sheet_number() {
        let script = parse_script("1:report; x:report ;2: edit_boundary 1 0,1 800,1;nonsense");
        assert_eq!(
            script,
            vec![
                (1, "report".to_string()),
                (2, "edit_boundary 1 0,1 800,1".to_string())
            ]
        );
    }

    #[test]
    fn demo_script_edits_and_reports() {
        let book = built_book();
        let script = demo_script(&book).expect("script");
        assert_eq!(script.len(), 4);
        assert!(script[0].1.starts_with("edit_boundary 1 0.00,"));

        let bus = CommandBus::new();
        for (number, line) in &script {
            let response = dispatch_cli_command(&bus, &book, *number, line).expect("dispatch");
            assert!(response.success, "{line}: {:?}", response.message);
        }
        assert!(matches!(
            dispatch_cli_command(&bus, &book, 9, "report"),
            Err(FrontendError::Engine(_))
        ));
    }
}
