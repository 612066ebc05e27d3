mod common;

use common::{jpeg_bytes, spawn_app, spawn_fake_model, test_config};
use pixelsense::config::ClientConfig;
use pixelsense::inference::Query;
use pixelsense::pipeline::Pipeline;
use pixelsense::session::{HttpBackend, InputMethod, SessionContext, SessionError, SessionState};

#[tokio::test]
async fn test_full_session_against_backend() {
    let app = spawn_app(|_| {}).await;
    let backend = HttpBackend::new(&ClientConfig {
        backend_url: app.base.clone(),
        ..ClientConfig::default()
    })
    .unwrap();

    let status = backend.status().await.unwrap();
    assert_eq!(status.stored_files, 0);

    let mut session = SessionContext::new(1024);
    session.choose_input(InputMethod::Upload).unwrap();
    let preview = session.capture(jpeg_bytes(2000, 1000)).unwrap();
    assert_eq!((preview.width, preview.height), (1024, 512));

    assert!(matches!(
        session.get_answer(&backend, Query::Caption).await,
        Err(SessionError::NotSaved)
    ));

    let reference = session.save(&backend).await.unwrap().clone();
    assert!(reference.is_local());
    assert_eq!(app.stored_files().await, 1);

    let caption = session.get_answer(&backend, Query::Caption).await.unwrap();
    assert_eq!(
        caption.to_string(),
        "Answer to: Provide a short descriptive caption for this image."
    );
    assert_eq!(session.state(), SessionState::AnswerReady);

    let answer = session
        .get_answer(&backend, Query::vqa("Is it striped?"))
        .await
        .unwrap();
    assert_eq!(answer.to_string(), "Answer to: Is it striped?");

    session.reset(&backend).await;
    assert_eq!(session.state(), SessionState::NoInput);
    assert!(session.reference().is_none());
    assert_eq!(app.stored_files().await, 0);
}

#[tokio::test]
async fn test_session_survives_model_failure() {
    // no API key: the backend answers with an error-tagged result
    let app = spawn_app(|config| config.inference.api_key.clear()).await;
    let backend = HttpBackend::new(&ClientConfig {
        backend_url: app.base.clone(),
        ..ClientConfig::default()
    })
    .unwrap();

    let mut session = SessionContext::new(1024);
    session.choose_input(InputMethod::Capture).unwrap();
    session.capture(jpeg_bytes(64, 48)).unwrap();
    session.save(&backend).await.unwrap();

    let answer = session.get_answer(&backend, Query::Caption).await.unwrap();
    assert!(!answer.is_ok());
    assert!(answer.to_string().starts_with("❌ Error:"));
    assert_eq!(session.state(), SessionState::ImageSaved);
}

#[tokio::test]
async fn test_in_process_pipeline_session() {
    let (model_base, model) = spawn_fake_model().await;
    let temp = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::from_config(&test_config(&temp, &model_base)).unwrap();

    let mut session = SessionContext::new(1024);
    session.choose_input(InputMethod::Upload).unwrap();
    session.capture(jpeg_bytes(500, 500)).unwrap();
    session.save(&pipeline).await.unwrap();
    assert_eq!(pipeline.store().local().entry_count().await.unwrap(), 1);

    let answer = session
        .get_answer(&pipeline, Query::vqa("What is in the corner?"))
        .await
        .unwrap();
    assert_eq!(answer.to_string(), "Answer to: What is in the corner?");
    assert_eq!(model.count(), 1);

    session.reset(&pipeline).await;
    assert_eq!(pipeline.store().local().entry_count().await.unwrap(), 0);
}
