use anyhow::{bail, Context};
use domain::{CommentRecord, ProjectedComment};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const BASE_URL: &str = "http://127.0.0.1:3000";
const DISCUSSION: &str = "hello-threadsync";
const VIEWER: &str = "ferris";

#[derive(Serialize)]
struct CreateCommentRequest {
    text: String,
    parent_id: Option<String>,
}

#[derive(Deserialize)]
struct PostCommentResponse {
    comment: Option<CommentRecord>,
}

async fn post(client: &reqwest::Client, text: &str, parent_id: Option<String>) -> anyhow::Result<CommentRecord> {
    let url = format!("{}/api/discussions/{}/comments?wait=true", BASE_URL, DISCUSSION);
    let resp = client
        .post(&url)
        .header("X-Viewer-Id", VIEWER)
        .json(&CreateCommentRequest {
            text: text.to_string(),
            parent_id,
        })
        .send()
        .await?;
    if !resp.status().is_success() {
        bail!("Post failed: {}", resp.text().await?);
    }
    let body: PostCommentResponse = resp.json().await?;
    body.comment.context("Server did not return the stored comment")
}

fn print_view(comments: &[ProjectedComment], indent: usize) {
    for c in comments {
        let name = c
            .author
            .as_ref()
            .map(|a| a.display_name.as_str())
            .unwrap_or(c.author_id.as_str());
        let marker = if c.flattened {
            format!(" (reply to {})", c.parent_id.as_deref().unwrap_or("?"))
        } else {
            String::new()
        };
        let heart = if c.liked { "♥" } else { "♡" };
        println!(
            "{}- {}: {} [{} {}]{}",
            "  ".repeat(indent),
            name,
            c.text,
            heart,
            c.like_count,
            marker
        );
        print_view(&c.replies, indent + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    println!("Starting threadsync demo client...");

    println!("\n[1/5] Registering author profile...");
    let resp = client
        .post(format!("{}/api/authors", BASE_URL))
        .header("X-Viewer-Id", VIEWER)
        .json(&serde_json::json!({ "display_name": "Ferris" }))
        .send()
        .await?;
    println!("   -> {}", resp.status());

    println!("\n[2/5] Waiting for the discussion to load...");
    let phase_url = format!("{}/api/discussions/{}/phase", BASE_URL, DISCUSSION);
    for _ in 0..50 {
        let phase: Value = client
            .get(&phase_url)
            .header("X-Viewer-Id", VIEWER)
            .send()
            .await?
            .json()
            .await?;
        if phase["state"] == "ready" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    println!("\n[3/5] Posting a chain of replies...");
    let mut parent: Option<String> = None;
    let mut first_id = None;
    for depth in 0..5 {
        let stored = post(&client, &format!("Reply at depth {}", depth), parent.clone()).await?;
        println!("   -> stored {}", stored.id);
        first_id.get_or_insert_with(|| stored.id.clone());
        parent = Some(stored.id);
    }

    println!("\n[4/5] Liking the first comment...");
    if let Some(id) = first_id {
        let url = format!(
            "{}/api/discussions/{}/comments/{}/like?wait=true",
            BASE_URL, DISCUSSION, id
        );
        let like: Value = client
            .post(&url)
            .header("X-Viewer-Id", VIEWER)
            .send()
            .await?
            .json()
            .await?;
        println!("   -> {}", like);
    }

    println!("\n[5/5] Projected view (max depth 3):");
    let view_url = format!("{}/api/discussions/{}/view?max_depth=3", BASE_URL, DISCUSSION);
    let view: Vec<ProjectedComment> = client
        .get(&view_url)
        .header("X-Viewer-Id", VIEWER)
        .send()
        .await?
        .json()
        .await?;
    print_view(&view, 1);

    Ok(())
}
