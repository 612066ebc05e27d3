use anyhow::Result;
use clap::Args;

use pixelsense::config::Config;
use pixelsense::inference::Query;
use pixelsense::session::{InputMethod, SessionContext};

use super::common::{make_service, read_file};

#[derive(Args)]
pub struct AskArgs {
    /// Image file to describe
    pub image: String,

    /// Question about the image (omit for a caption)
    #[arg(short, long)]
    pub question: Option<String>,

    /// Run inference in-process instead of calling the backend
    #[arg(long)]
    pub local: bool,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: AskArgs, config: &Config) -> Result<()> {
    let service = make_service(config, args.local)?;
    let (bytes, _) = read_file(&args.image).await?;

    let mut session = SessionContext::new(config.image.max_dim);
    session.choose_input(InputMethod::Upload)?;
    session.capture(bytes)?;
    session.save(service.as_ref()).await?;

    let query = match args.question {
        Some(q) => Query::vqa(q),
        None => Query::Caption,
    };
    let answer = session.get_answer(service.as_ref(), query.clone()).await?.clone();
    session.reset(service.as_ref()).await;

    if args.format == "json" {
        let out = serde_json::json!({
            "type": query.kind(),
            "question": match &query {
                Query::Vqa { question } => Some(question.as_str()),
                Query::Caption => None,
            },
            "answer": answer.to_string(),
            "status": answer.status(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", answer);
    }

    if !answer.is_ok() {
        anyhow::bail!("No answer for {}", args.image);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_failed_local_answer_cleans_up_temp_store() {
        let dir = tempfile::tempdir().unwrap();
        let store_parent = dir.path().join("store");
        std::fs::create_dir(&store_parent).unwrap();

        let image_path = dir.path().join("cat.png");
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(32, 16))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        std::fs::write(&image_path, png).unwrap();

        // no API key, so the answer fails
        let mut config = Config::default();
        config.storage.temp_dir = Some(store_parent.to_string_lossy().to_string());

        let args = AskArgs {
            image: image_path.to_string_lossy().to_string(),
            question: None,
            local: true,
            format: "text".to_string(),
        };
        assert!(run(args, &config).await.is_err());
        assert_eq!(std::fs::read_dir(&store_parent).unwrap().count(), 0);
    }
}
