//! End-to-end pipeline tests: register → extract → chunk → embed →
//! persist → retrieve → prompt, against a temporary database and the
//! mock engine.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use localkb::config::RetrievalConfig;
use localkb::engine::{EngineHandle, MockEngine};
use localkb::ingest::KnowledgeBase;
use localkb::models::{ChatMessage, Message, KB_EMBEDDING_MODEL_KEY, KB_FOLDER_KEY};
use localkb::search::Retriever;
use localkb::{db, migrate, prompt, store};

struct TestCtx {
    _dir: TempDir,
    kb_folder: PathBuf,
    pool: sqlx::SqlitePool,
    engine: EngineHandle,
    kb: Arc<KnowledgeBase>,
    retriever: Retriever,
}

async fn setup_with_engine(engine: MockEngine) -> TestCtx {
    let dir = TempDir::new().unwrap();
    let kb_folder = dir.path().join("kb");
    std::fs::create_dir_all(&kb_folder).unwrap();

    let pool = db::connect(&dir.path().join("data/knowledge.db"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    store::set_setting(&pool, KB_FOLDER_KEY, &kb_folder.to_string_lossy())
        .await
        .unwrap();

    let engine = EngineHandle::new(Box::new(engine));
    let kb = KnowledgeBase::new(pool.clone(), engine.clone());
    let retriever = Retriever::new(pool.clone(), engine.clone(), RetrievalConfig::default());

    TestCtx {
        _dir: dir,
        kb_folder,
        pool,
        engine,
        kb,
        retriever,
    }
}

async fn setup() -> TestCtx {
    setup_with_engine(MockEngine::new("mock-model")).await
}

fn user_turn(content: &str) -> Vec<Message> {
    vec![Message {
        id: 1,
        conversation_id: 1,
        role: "user".to_string(),
        content: content.to_string(),
        created_at: 0,
        updated_at: 0,
    }]
}

/// Minimal DOCX (ZIP with word/document.xml) carrying one paragraph.
fn minimal_docx(text: &str) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("word/document.xml", options).unwrap();
        write!(
            writer,
            r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>{text}</w:t></w:r></w:p></w:body></w:document>"#
        )
        .unwrap();
        writer.finish().unwrap();
    }
    buf.into_inner()
}

#[tokio::test]
async fn ingest_then_retrieve_then_prompt() {
    let ctx = setup().await;

    let notes = ctx.kb_folder.join("notes.txt");
    std::fs::write(&notes, "Paris is the capital of France.").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, "processed");

    let hits = ctx.retriever.query("capital of France", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "Paris is the capital of France.");
    // The mock engine embedded the chunk.
    assert!(!hits[0].vector.is_empty());

    let history = prompt::build_history_with_kb(
        &ctx.pool,
        &ctx.retriever,
        &user_turn("capital of France"),
        10,
        "capital of France",
    )
    .await;
    let content = &history.last().unwrap().content;
    assert!(content.contains("[参考1]\nParis is the capital of France."));
    assert!(content.ends_with("问题：\ncapital of France"));
}

#[tokio::test]
async fn attachment_is_spliced_as_context() {
    let ctx = setup().await;

    let report = ctx.kb_folder.join("report.txt");
    std::fs::write(&report, "Q3 revenue was 1.2M.").unwrap();
    ctx.kb.add_file(&report).await.unwrap();

    let msg = "解释下面文件 [已上传文件: [report.txt](/api/kb/download?file=report.txt)]";
    let history =
        prompt::build_history_with_kb(&ctx.pool, &ctx.retriever, &user_turn(msg), 10, msg).await;
    let content = &history.last().unwrap().content;
    assert!(content.contains("[上下文1]\nQ3 revenue was 1.2M."));
}

#[tokio::test]
async fn attachment_resolves_via_kb_folder_when_unregistered() {
    let ctx = setup().await;

    // Present on disk but never registered: resolution falls back to a
    // join with the configured folder.
    std::fs::write(ctx.kb_folder.join("摘要.txt"), "本季度营收增长两成。").unwrap();

    let msg = "[已上传文件: [摘要.txt](/api/kb/download?file=%E6%91%98%E8%A6%81.txt)]";
    let history =
        prompt::build_history_with_kb(&ctx.pool, &ctx.retriever, &user_turn(msg), 10, msg).await;
    assert!(history
        .last()
        .unwrap()
        .content
        .contains("[上下文1]\n本季度营收增长两成。"));
}

#[tokio::test]
async fn embedding_failure_degrades_to_keyword_search() {
    let ctx = setup_with_engine(MockEngine::new("mock-model").with_embedding_failure()).await;

    let notes = ctx.kb_folder.join("fallback.txt");
    std::fs::write(&notes, "Sharding strategy for the orders table.").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(files[0].status, "processed");

    // Chunks exist, vectors are empty.
    let hits = ctx.retriever.query("sharding", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].vector.is_empty());
    assert!(hits[0].content.contains("Sharding strategy"));
}

#[tokio::test]
async fn docx_ingests_with_paragraph_text() {
    let ctx = setup().await;

    let doc = ctx.kb_folder.join("design.docx");
    std::fs::write(&doc, minimal_docx("Consensus protocol design notes")).unwrap();
    ctx.kb.add_file(&doc).await.unwrap();

    let hits = ctx.retriever.query("consensus protocol", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("Consensus protocol design notes"));
}

#[tokio::test]
async fn xlsx_rows_become_row_semantic_chunks() {
    let ctx = setup().await;

    // Build a small xlsx by hand: workbook + one sheet, inline strings.
    let path = ctx.kb_folder.join("成绩.xlsx");
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("xl/workbook.xml", options).unwrap();
        write!(
            writer,
            r#"<?xml version="1.0"?><workbook><sheets><sheet name="成绩表" sheetId="1"/></sheets></workbook>"#
        )
        .unwrap();
        writer.start_file("xl/worksheets/sheet1.xml", options).unwrap();
        write!(
            writer,
            r#"<?xml version="1.0"?><worksheet><sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>编号</t></is></c><c r="B1" t="inlineStr"><is><t>成绩</t></is></c></row>
<row r="2"><c r="A2" t="inlineStr"><is><t>1001</t></is></c><c r="B2"><v>92</v></c></row>
<row r="3"><c r="A3" t="inlineStr"><is><t>1002</t></is></c><c r="B3"><v>85</v></c></row>
</sheetData></worksheet>"#
        )
        .unwrap();
        writer.finish().unwrap();
    }
    std::fs::write(&path, buf.into_inner()).unwrap();

    ctx.kb.add_file(&path).await.unwrap();

    let hits = ctx.retriever.query("1001", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    let content = &hits[0].content;
    assert!(content.starts_with("数据来源: Excel；文件: 成绩.xlsx\n"));
    assert!(content.contains("工作表: 成绩表；行: 2；编号: 1001；成绩: 92；"));
    assert!(content.contains("工作表: 成绩表；行: 3；编号: 1002；成绩: 85；"));
}

#[tokio::test]
async fn rescan_is_idempotent() {
    let ctx = setup().await;

    std::fs::write(ctx.kb_folder.join("a.txt"), "alpha").unwrap();
    std::fs::write(ctx.kb_folder.join("b.md"), "beta").unwrap();
    std::fs::write(ctx.kb_folder.join(".~lock.a.txt"), "temp").unwrap();
    std::fs::write(ctx.kb_folder.join("c.bin"), "skip").unwrap();

    ctx.kb.scan_folder().await.unwrap();
    let first = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(first.len(), 2);

    ctx.kb.scan_folder().await.unwrap();
    let second = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(second.len(), 2);
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(b.status, "pending");
    }
}

#[tokio::test]
async fn process_files_is_noop_for_processed_files() {
    let ctx = setup().await;

    let notes = ctx.kb_folder.join("done.txt");
    std::fs::write(&notes, "already processed content").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    // Nothing pending: progress resets to idle and no statuses change.
    ctx.kb.process_files().await.unwrap();
    assert_eq!(ctx.kb.sync_progress().status, "idle");
    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(files[0].status, "processed");
}

#[tokio::test]
async fn cancel_resets_progress_and_allows_restart() {
    let ctx = setup().await;

    for i in 0..8 {
        let path = ctx.kb_folder.join(format!("f{i}.txt"));
        std::fs::write(&path, "content ".repeat(500)).unwrap();
    }
    ctx.kb.scan_folder().await.unwrap();

    let kb = ctx.kb.clone();
    let worker = tokio::spawn(async move { kb.process_files().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.kb.cancel_sync();

    // Whether the run finished or was cancelled, the controller must be
    // reusable afterwards.
    let _ = worker.await.unwrap();
    assert_eq!(ctx.kb.sync_progress().status, "idle");

    ctx.kb.scan_folder().await.unwrap();
    ctx.kb.process_files().await.unwrap();
    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert!(files.iter().all(|f| f.status == "processed"));
}

#[tokio::test]
async fn reingest_replaces_chunks_not_duplicates() {
    let ctx = setup().await;

    let notes = ctx.kb_folder.join("evolving.txt");
    std::fs::write(&notes, "first version").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();
    std::fs::write(&notes, "second version").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(
        store::count_file_chunks(&ctx.pool, files[0].id).await.unwrap(),
        1
    );
    let hits = ctx.retriever.query("version", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "second version");
}

#[tokio::test]
async fn embedding_model_mismatch_fails_ingest() {
    let ctx = setup().await;
    store::set_setting(&ctx.pool, KB_EMBEDDING_MODEL_KEY, "some-other-model")
        .await
        .unwrap();

    let notes = ctx.kb_folder.join("guarded.txt");
    std::fs::write(&notes, "guarded content").unwrap();
    let err = ctx.kb.add_file(&notes).await.unwrap_err();
    assert!(err.to_string().contains("embedding model changed"));

    let files = store::list_kb_files(&ctx.pool).await.unwrap();
    assert_eq!(files[0].status, "error");
}

#[tokio::test]
async fn ingest_records_embedding_model() {
    let ctx = setup().await;

    let notes = ctx.kb_folder.join("first.txt");
    std::fs::write(&notes, "hello knowledge base").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    let recorded = store::get_kb_embedding_model(&ctx.pool).await.unwrap();
    assert_eq!(recorded.as_deref(), Some("mock-model"));
}

#[tokio::test]
async fn concurrent_streams_serialize_on_the_engine() {
    use localkb::stream::{stream_plain_tokens, StreamOptions, TokenProducer};

    let ctx = setup_with_engine(MockEngine::new("m").with_reply("alpha beta gamma")).await;

    let make_stream = |engine: EngineHandle| {
        let history = vec![ChatMessage::new("user", "hi")];
        let produce: TokenProducer =
            Box::new(move |emit| engine.lock_sync(|e| e.chat_stream(&history, emit)));
        stream_plain_tokens(produce, StreamOptions::default())
    };

    let a = make_stream(ctx.engine.clone());
    let b = make_stream(ctx.engine.clone());

    let (body_a, body_b) = tokio::join!(
        axum::body::to_bytes(a.response.into_body(), usize::MAX),
        axum::body::to_bytes(b.response.into_body(), usize::MAX),
    );
    assert_eq!(body_a.unwrap().as_ref(), b"alpha beta gamma");
    assert_eq!(body_b.unwrap().as_ref(), b"alpha beta gamma");

    let (text_a, res_a) = a.completion.await.unwrap();
    let (text_b, res_b) = b.completion.await.unwrap();
    assert!(res_a.is_ok() && res_b.is_ok());
    assert_eq!(text_a, "alpha beta gamma");
    assert_eq!(text_b, "alpha beta gamma");
}

#[tokio::test]
async fn debug_search_reports_similarity_and_caps_limit() {
    let ctx = setup().await;

    let notes = ctx.kb_folder.join("dbg.txt");
    std::fs::write(&notes, "observability pipeline notes").unwrap();
    ctx.kb.add_file(&notes).await.unwrap();

    let result = ctx
        .retriever
        .debug_search("observability", 500)
        .await
        .unwrap();
    assert_eq!(result.candidates, 1);
    assert_eq!(result.results.len(), 1);
    assert!(result.results[0].has_vector);
    assert_eq!(result.kb_embedding_model, "mock-model");
    assert_eq!(result.current_model, "mock-model");
}
