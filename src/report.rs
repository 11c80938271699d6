use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};

use crate::config::EvalConfig;
use crate::models::{AggregatedData, Comment, EvaluationRecord};
use crate::stats;
use crate::store::RecordStore;

pub fn csv_filename(date: NaiveDate) -> String {
    format!("ksi_eval_v2_{date}.csv")
}

pub fn pdf_filename(date: NaiveDate) -> String {
    format!("ksi_360_full_report_{date}.pdf")
}

// One row per record, one column per question (label truncated to five
// characters), scores defaulting to 0. The BOM makes spreadsheet tools pick
// UTF-8. Returns None when there is nothing to export.
pub fn csv_bytes(
    config: &EvalConfig,
    records: &[EvaluationRecord],
) -> anyhow::Result<Option<Vec<u8>>> {
    if records.is_empty() {
        return Ok(None);
    }

    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new());

    let mut header: Vec<String> = vec!["Time".into(), "Evaluator".into(), "Target".into()];
    for q in config.positive_questions() {
        header.push(format!("POS_{}", truncate_label(q)));
    }
    for q in config.negative_questions() {
        header.push(format!("NEG_{}", truncate_label(q)));
    }
    header.extend([
        "Start_Suggestion".to_string(),
        "Stop_Suggestion".to_string(),
        "Continue_Suggestion".to_string(),
    ]);
    writer.write_record(&header)?;

    for record in records {
        let mut row: Vec<String> = vec![
            record.timestamp.to_rfc3339(),
            record.evaluator.clone(),
            record.target.clone(),
        ];
        for q in config.positive_questions() {
            row.push(format_score(record.pos_scores.get(q).copied().unwrap_or(0.0)));
        }
        for q in config.negative_questions() {
            row.push(format_score(record.neg_scores.get(q).copied().unwrap_or(0.0)));
        }
        row.push(record.text_start.clone());
        row.push(record.text_stop.clone());
        row.push(record.text_continue.clone());
        writer.write_record(&row)?;
    }

    writer.flush()?;
    let body = writer
        .into_inner()
        .map_err(|err| anyhow!("failed to finish csv: {err}"))?;

    let mut bytes = vec![0xEF, 0xBB, 0xBF];
    bytes.extend_from_slice(&body);
    Ok(Some(bytes))
}

fn truncate_label(question: &str) -> String {
    question.chars().take(5).collect()
}

// Integers without a trailing .0, halves as-is, like the form shows them.
fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

// Process-wide export lock. A second export requested while one runs is
// ignored; the flag is released on drop, on every exit path.
static EXPORT_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

pub struct ExportGuard {
    _priv: (),
}

impl ExportGuard {
    pub fn try_acquire() -> Option<ExportGuard> {
        EXPORT_IN_FLIGHT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(ExportGuard { _priv: () })
    }
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        EXPORT_IN_FLIGHT.store(false, Ordering::SeqCst);
    }
}

// One A4 page per roster member with data; members without data are skipped
// rather than given a blank page, and an all-empty roster aborts the export.
pub async fn export_pdf(
    store: &dyn RecordStore,
    config: &EvalConfig,
    path: &Path,
) -> anyhow::Result<usize> {
    let records = store
        .list_ordered()
        .await
        .context("failed to load evaluations for export")?;

    let mut pages = Vec::new();
    for target in &config.roster {
        if let Some(aggregate) = stats::aggregate(config, target, &records) {
            pages.push(aggregate);
        }
    }

    write_pdf_report(config, &pages, path)
}

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN_LEFT: f32 = 48.0;
const MARGIN_BOTTOM: f32 = 40.0;

pub fn write_pdf_report(
    config: &EvalConfig,
    pages: &[AggregatedData],
    path: &Path,
) -> anyhow::Result<usize> {
    if pages.is_empty() {
        bail!("no evaluation data to export");
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    // Type0 font over the predefined UniGB-UCS2-H CMap. Strings are UTF-16BE
    // and the reader supplies the Adobe-GB1 glyphs, so the whole CJK report
    // text survives without shipping a font program in the artifact.
    let descendant_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType0",
        "BaseFont" => "STSong-Light",
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("GB1"),
            "Supplement" => 5,
        },
        "DW" => 1000,
    });
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => "STSong-Light",
        "Encoding" => "UniGB-UCS2-H",
        "DescendantFonts" => vec![descendant_id.into()],
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for aggregate in pages {
        let content = compose_target_page(config, aggregate);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    doc.save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(count)
}

struct PageWriter {
    ops: Vec<Operation>,
    y: f32,
}

impl PageWriter {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            y: PAGE_HEIGHT - 48.0,
        }
    }

    fn line(&mut self, size: f32, indent: f32, text: &str) {
        // Below the margin; drop the rest rather than draw off the page.
        if self.y < MARGIN_BOTTOM {
            return;
        }
        self.ops.push(Operation::new("BT", vec![]));
        self.ops
            .push(Operation::new("Tf", vec!["F1".into(), size.into()]));
        self.ops.push(Operation::new(
            "Td",
            vec![(MARGIN_LEFT + indent).into(), self.y.into()],
        ));
        self.ops.push(Operation::new(
            "Tj",
            vec![Object::String(utf16be(text), StringFormat::Hexadecimal)],
        ));
        self.ops.push(Operation::new("ET", vec![]));
        self.y -= size * 1.5;
    }

    fn gap(&mut self, amount: f32) {
        self.y -= amount;
    }

    fn into_content(self) -> Content {
        Content {
            operations: self.ops,
        }
    }
}

fn utf16be(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

fn compose_target_page(config: &EvalConfig, aggregate: &AggregatedData) -> Content {
    let mut page = PageWriter::new();

    page.line(20.0, 0.0, &aggregate.target);
    page.line(11.0, 0.0, "360度高管互评反馈报告 (2026)");
    page.line(11.0, 0.0, &format!("收到评价：{}", aggregate.count));
    page.gap(8.0);

    page.line(13.0, 0.0, "正向指标平均分");
    for metric in &config.positive_metrics {
        let avg = aggregate.avg_pos.get(&metric.title).copied().unwrap_or(0.0);
        page.line(10.0, 12.0, &format!("{}  {avg}", metric.title));
    }
    page.gap(8.0);

    page.line(13.0, 0.0, "负向指标平均分");
    for metric in &config.negative_metrics {
        let avg = aggregate.avg_neg.get(&metric.title).copied().unwrap_or(0.0);
        let label = metric.score_label.as_deref().unwrap_or("");
        page.line(10.0, 12.0, &format!("{} {label}  {avg}", metric.title));
    }
    page.gap(8.0);

    comment_section(&mut page, "Start (建议开始做)", &aggregate.comments_start);
    comment_section(&mut page, "Stop (建议停止做)", &aggregate.comments_stop);
    comment_section(
        &mut page,
        "Continue (建议继续保持)",
        &aggregate.comments_continue,
    );

    page.into_content()
}

fn comment_section(page: &mut PageWriter, title: &str, comments: &[Comment]) {
    page.line(13.0, 0.0, title);
    if comments.is_empty() {
        page.line(10.0, 12.0, "暂无建议");
    } else {
        for comment in comments {
            let text: String = comment.text.chars().take(90).collect();
            page.line(10.0, 12.0, &format!("评价人 {}：{}", comment.evaluator, text));
        }
    }
    page.gap(8.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::models::Submission;
    use crate::store::{save_evaluation, LocalStore};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn record(
        config: &EvalConfig,
        evaluator: &str,
        target: &str,
        pos: &[f64],
        text_start: &str,
    ) -> EvaluationRecord {
        let mut pos_scores = HashMap::new();
        for (q, &score) in config.positive_questions().iter().zip(pos) {
            pos_scores.insert(q.to_string(), score);
        }
        EvaluationRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            evaluator: evaluator.to_string(),
            target: target.to_string(),
            pos_scores,
            neg_scores: HashMap::new(),
            text_start: text_start.to_string(),
            text_stop: String::new(),
            text_continue: String::new(),
        }
    }

    async fn save(store: &LocalStore, cfg: &EvalConfig, evaluator: &str, target: &str, text: &str) {
        save_evaluation(
            store,
            cfg,
            Submission {
                evaluator: evaluator.to_string(),
                target: target.to_string(),
                pos_scores: HashMap::new(),
                neg_scores: HashMap::new(),
                text_start: text.to_string(),
                text_stop: String::new(),
                text_continue: String::new(),
            },
        )
        .await
        .unwrap();
    }

    fn hex(text: &str) -> String {
        utf16be(text).iter().map(|b| format!("{b:02X}")).collect()
    }

    #[test]
    fn filenames_are_deterministic() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(csv_filename(date), "ksi_eval_v2_2026-03-01.csv");
        assert_eq!(pdf_filename(date), "ksi_360_full_report_2026-03-01.pdf");
    }

    #[test]
    fn empty_record_set_exports_nothing() {
        let cfg = config::builtin();
        assert!(csv_bytes(&cfg, &[]).unwrap().is_none());
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let cfg = config::builtin();
        let records = vec![record(&cfg, "钱啸", "李倩", &[8.0], "")];
        let bytes = csv_bytes(&cfg, &records).unwrap().unwrap();
        assert_eq!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);

        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("\"Time\",\"Evaluator\",\"Target\",\"POS_"));
        assert!(header.ends_with("\"Start_Suggestion\",\"Stop_Suggestion\",\"Continue_Suggestion\""));
    }

    #[test]
    fn csv_round_trips_scores_and_text() {
        let cfg = config::builtin();
        let records = vec![
            record(&cfg, "钱啸", "李倩", &[8.0, 6.5], "she said \"go\""),
            // No scores at all; every cell must read back as 0.
            record(&cfg, "陈芳", "李倩", &[], ""),
        ];

        let bytes = csv_bytes(&cfg, &records).unwrap().unwrap();
        let mut reader = csv::Reader::from_reader(&bytes[3..]);
        let rows: Vec<csv::StringRecord> =
            reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);

        let n_pos = cfg.positive_questions().len();
        let n_neg = cfg.negative_questions().len();
        assert_eq!(rows[0].len(), 3 + n_pos + n_neg + 3);

        assert_eq!(&rows[0][1], "钱啸");
        assert_eq!(&rows[0][2], "李倩");
        assert_eq!(rows[0][3].parse::<f64>().unwrap(), 8.0);
        assert_eq!(rows[0][4].parse::<f64>().unwrap(), 6.5);
        assert_eq!(&rows[0][3 + n_pos + n_neg], "she said \"go\"");

        for cell in 3..3 + n_pos + n_neg {
            assert_eq!(rows[1][cell].parse::<f64>().unwrap(), 0.0);
        }
    }

    #[test]
    fn score_cells_render_like_the_form() {
        assert_eq!(format_score(4.0), "4");
        assert_eq!(format_score(4.5), "4.5");
        assert_eq!(format_score(0.0), "0");
    }

    #[test]
    fn labels_truncate_to_five_chars() {
        assert_eq!(truncate_label("1. 【专业壁垒】行业洞察"), "1. 【专");
        assert_eq!(truncate_label("abc"), "abc");
    }

    #[test]
    fn export_guard_admits_one_holder() {
        let first = ExportGuard::try_acquire().unwrap();
        assert!(ExportGuard::try_acquire().is_none());
        drop(first);
        assert!(ExportGuard::try_acquire().is_some());
    }

    #[tokio::test]
    async fn pdf_export_skips_targets_without_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("records.json"));
        let cfg = config::builtin();

        // Two roster members receive evaluations; the rest have no pages.
        save(&store, &cfg, "钱啸", "李倩", "建议").await;
        save(&store, &cfg, "李倩", "钱啸", "建议").await;
        save(&store, &cfg, "陈芳", "李倩", "建议").await;

        let out = dir.path().join("report.pdf");
        let pages = export_pdf(&store, &cfg, &out).await.unwrap();
        assert_eq!(pages, 2);

        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
        let parsed = Document::load_mem(&bytes).unwrap();
        assert_eq!(parsed.get_pages().len(), 2);
    }

    #[tokio::test]
    async fn pdf_pages_carry_cjk_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("records.json"));
        let cfg = config::builtin();

        save(&store, &cfg, "李倩", "钱啸", "多给团队一线支持").await;

        let out = dir.path().join("report.pdf");
        export_pdf(&store, &cfg, &out).await.unwrap();

        // Content streams are uncompressed UTF-16BE hex strings; the target
        // name and the comment must both survive into the page text.
        let raw = String::from_utf8_lossy(&std::fs::read(&out).unwrap()).into_owned();
        assert!(raw.contains(&hex("钱啸")));
        assert!(raw.contains(&hex("多给团队一线支持")));
        assert!(raw.contains(&hex("暂无建议")));
        assert!(raw.contains("UniGB-UCS2-H"));
    }

    #[tokio::test]
    async fn pdf_export_aborts_when_nothing_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("records.json"));
        let cfg = config::builtin();

        let out = dir.path().join("report.pdf");
        assert!(export_pdf(&store, &cfg, &out).await.is_err());
        assert!(!out.exists());
    }
}
