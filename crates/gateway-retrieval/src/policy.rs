//! Retrieval policies: how (and whether) a chat prompt gets augmented.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use gateway_core::{ChatMessage, GatewayError, ModelRecordId};
use gateway_stream::ServerStatusHolder;

use crate::knowledge::{Document, KnowledgeStore};

/// A query under this length pulls recent chat turns in as retrieval
/// context.
const SHORT_QUERY_CHARS: usize = 200;
/// Cap on the assembled retrieval query before it gets summarised.
const QUERY_CHAR_CAP: usize = 4_000;
/// Helper summaries shorter than a tweet are discarded as useless.
const MIN_USEFUL_SUMMARY: usize = 140;
/// Total document budget for the assembled context block.
const DOC_CHAR_BUDGET: usize = 40_000;

const SIMPLE_TOP_K: usize = 18;
const SUMMARIZING_TOP_K: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalPolicy {
    #[default]
    Skip,
    Simple,
    Summarizing,
}

impl FromStr for RetrievalPolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "simple" => Ok(Self::Simple),
            "summarizing" => Ok(Self::Summarizing),
            other => Err(GatewayError::BadRequest(format!(
                "unknown retrieval policy: {other}"
            ))),
        }
    }
}

/// Client-requested retrieval configuration for one continuation.
#[derive(Debug, Clone, Default)]
pub struct RetrievalLabel {
    pub policy: RetrievalPolicy,
    /// JSON search arguments, e.g. `{"k": 12}`.
    pub search_args: Option<String>,
    pub preferred_embedding_model: Option<ModelRecordId>,
}

/// Secondary-inference callback used by the summarizing policy. Every call
/// is an independent InferenceEvent on the caller's side.
#[async_trait]
pub trait GenerateHelper: Send + Sync {
    async fn generate(
        &self,
        reason: &str,
        system_message: Option<&str>,
        user_prompt: &str,
        assistant_seed: Option<&str>,
    ) -> Result<String, GatewayError>;
}

/// Builds the augmented prompt for the selected policy, or `None` when the
/// original chat should be sent unchanged.
pub async fn with_retrieval(
    label: &RetrievalLabel,
    messages: &[ChatMessage],
    helper: &dyn GenerateHelper,
    knowledge: &dyn KnowledgeStore,
    status: &ServerStatusHolder,
) -> Result<Option<String>, GatewayError> {
    match label.policy {
        RetrievalPolicy::Skip => Ok(None),
        RetrievalPolicy::Simple => simple(label, messages, knowledge, status).await,
        RetrievalPolicy::Summarizing => {
            summarizing(label, messages, helper, knowledge, status).await
        }
    }
}

fn last_user_content(messages: &[ChatMessage]) -> &str {
    messages.last().map(|m| m.content.as_str()).unwrap_or_default()
}

fn top_k(label: &RetrievalLabel, fallback: usize) -> usize {
    label
        .search_args
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|args| args.get("k").and_then(Value::as_u64))
        .map(|k| k as usize)
        .unwrap_or(fallback)
}

fn doc_total_len(documents: &[Document]) -> usize {
    documents.iter().map(|d| d.page_content.len()).sum()
}

fn join_docs(documents: &[Document]) -> String {
    documents
        .iter()
        .map(|d| d.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn simple(
    label: &RetrievalLabel,
    messages: &[ChatMessage],
    knowledge: &dyn KnowledgeStore,
    status: &ServerStatusHolder,
) -> Result<Option<String>, GatewayError> {
    let question = last_user_content(messages);

    let _scope = status.scope("retrieving documents");
    let documents = knowledge
        .retrieve(question, top_k(label, SIMPLE_TOP_K))
        .await;
    info!(
        "retrieval context: {} doc(s), {} chars",
        documents.len(),
        doc_total_len(&documents)
    );

    Ok(Some(format!(
        "Use any sources you can. Some recent context is provided to try and provide newer information:\n\
         \n\
         <context>\n{}\n</context>\n\
         \n\
         Reasoning: Let's think step by step in order to produce the answer.\n\
         \n\
         Question: {question}",
        join_docs(&documents)
    )))
}

async fn summarizing(
    label: &RetrievalLabel,
    messages: &[ChatMessage],
    helper: &dyn GenerateHelper,
    knowledge: &dyn KnowledgeStore,
    status: &ServerStatusHolder,
) -> Result<Option<String>, GatewayError> {
    let question = last_user_content(messages);

    // Stage 1: shape the retrieval query.
    let mut retrieval_query = question.to_string();
    if retrieval_query.len() < SHORT_QUERY_CHARS {
        // Short queries lean on recent turns, but only for retrieval.
        retrieval_query.clear();
        for message in messages.iter().rev() {
            if retrieval_query.len() > QUERY_CHAR_CAP {
                break;
            }
            retrieval_query.push_str(&message.content);
            retrieval_query.push_str("\n\n");
        }
    }

    if retrieval_query.len() > QUERY_CHAR_CAP {
        let _scope = status.scope("summarizing query for retrieval");
        let summary = helper
            .generate(
                "summarize prompt for retrieval",
                Some("Summarize the most important and unique terms in the following query"),
                question,
                None,
            )
            .await?;
        if summary.trim().is_empty() || summary.len() < MIN_USEFUL_SUMMARY {
            retrieval_query = question.to_string();
        } else {
            info!("query summary for retrieval: {} chars", summary.len());
            retrieval_query = summary;
        }
    }

    // Stage 2: fetch.
    let mut documents = {
        let _scope = status.scope("retrieving documents");
        knowledge
            .retrieve(&retrieval_query, top_k(label, SUMMARIZING_TOP_K))
            .await
    };
    if documents.is_empty() {
        return Ok(None);
    }

    // Stage 3: reduce. First by summarising oversized documents against the
    // question, then by dropping tail documents, then by plain truncation.
    if doc_total_len(&documents) > DOC_CHAR_BUDGET {
        debug!(
            "retrieved {} doc(s) totalling {} chars, reducing",
            documents.len(),
            doc_total_len(&documents)
        );

        for index in 0..documents.len() {
            if doc_total_len(&documents) <= DOC_CHAR_BUDGET {
                break;
            }
            let _scope = status.scope(format!(
                "summarizing document {}/{}",
                index + 1,
                documents.len()
            ));
            let summary = helper
                .generate(
                    "summarize document",
                    Some(
                        "Provide a concise summary of the provided document. Call out any \
                         sections that seem closely related to the original query.",
                    ),
                    &format!(
                        "<query>\n{question}\n</query>\n\n<document>\n{}\n</document>",
                        documents[index].page_content
                    ),
                    Some("Summary of the returned document: "),
                )
                .await?;
            if summary.trim().is_empty() || summary.len() < MIN_USEFUL_SUMMARY {
                continue;
            }
            info!(
                "document summarized, {} => {} chars",
                documents[index].page_content.len(),
                summary.len()
            );
            documents[index].page_content = summary;
        }

        while doc_total_len(&documents) > DOC_CHAR_BUDGET && documents.len() > 1 {
            documents.pop();
        }
        if doc_total_len(&documents) > DOC_CHAR_BUDGET {
            debug!("single remaining document still too long, truncating");
            let truncated: String = documents[0]
                .page_content
                .chars()
                .take(DOC_CHAR_BUDGET)
                .collect();
            documents[0].page_content = truncated;
        }
    }

    Ok(Some(format!(
        "Use context where you can, but don't rely on it overmuch:\n\
         \n\
         <context>\n{}\n</context>\n\
         \n\
         Reasoning: Let's think step by step in order to produce the answer.\n\
         \n\
         Question: {question}",
        join_docs(&documents)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::InMemoryKnowledge;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubHelper {
        calls: Arc<AtomicUsize>,
        response: String,
    }

    #[async_trait]
    impl GenerateHelper for StubHelper {
        async fn generate(
            &self,
            _reason: &str,
            _system_message: Option<&str>,
            _user_prompt: &str,
            _assistant_seed: Option<&str>,
        ) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn helper(response: &str) -> (StubHelper, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            StubHelper {
                calls: calls.clone(),
                response: response.to_string(),
            },
            calls,
        )
    }

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", content)]
    }

    #[tokio::test]
    async fn skip_returns_none_without_touching_anything() {
        let (stub, calls) = helper("unused");
        let knowledge = InMemoryKnowledge::default();
        let label = RetrievalLabel::default();

        let result = with_retrieval(
            &label,
            &user("hello"),
            &stub,
            &knowledge,
            &ServerStatusHolder::new(""),
        )
        .await
        .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn simple_wraps_documents_in_a_context_block() {
        let (stub, _) = helper("unused");
        let knowledge = InMemoryKnowledge::new(vec![Document::new("the sky is blue")]);
        let label = RetrievalLabel {
            policy: RetrievalPolicy::Simple,
            ..Default::default()
        };

        let prompt = with_retrieval(
            &label,
            &user("why is the sky blue?"),
            &stub,
            &knowledge,
            &ServerStatusHolder::new(""),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(prompt.contains("<context>\nthe sky is blue\n</context>"));
        assert!(prompt.contains("Question: why is the sky blue?"));
    }

    #[tokio::test]
    async fn summarizing_returns_none_when_nothing_matches() {
        let (stub, _) = helper("unused");
        let knowledge = InMemoryKnowledge::default();
        let label = RetrievalLabel {
            policy: RetrievalPolicy::Summarizing,
            ..Default::default()
        };

        let result = with_retrieval(
            &label,
            &user("anything"),
            &stub,
            &knowledge,
            &ServerStatusHolder::new(""),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn short_query_skips_the_summarisation_helper() {
        let (stub, calls) = helper("unused");
        let knowledge = InMemoryKnowledge::new(vec![Document::new("sky facts")]);
        let label = RetrievalLabel {
            policy: RetrievalPolicy::Summarizing,
            ..Default::default()
        };

        let prompt = with_retrieval(
            &label,
            &user("sky?"),
            &stub,
            &knowledge,
            &ServerStatusHolder::new(""),
        )
        .await
        .unwrap();
        assert!(prompt.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_documents_are_summarised_against_the_query() {
        let long_summary = "S".repeat(MIN_USEFUL_SUMMARY + 10);
        let (stub, calls) = helper(&long_summary);
        let knowledge = InMemoryKnowledge::new(vec![
            Document::new(format!("sky {}", "x".repeat(DOC_CHAR_BUDGET))),
            Document::new("sky appendix"),
        ]);
        let label = RetrievalLabel {
            policy: RetrievalPolicy::Summarizing,
            ..Default::default()
        };

        let prompt = with_retrieval(
            &label,
            &user("sky?"),
            &stub,
            &knowledge,
            &ServerStatusHolder::new(""),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(prompt.contains(&long_summary));
        assert!(prompt.len() < DOC_CHAR_BUDGET + 1_000);
    }

    #[test]
    fn policy_parsing_rejects_unknown_names() {
        assert_eq!("skip".parse::<RetrievalPolicy>().unwrap(), RetrievalPolicy::Skip);
        assert_eq!(
            "summarizing".parse::<RetrievalPolicy>().unwrap(),
            RetrievalPolicy::Summarizing
        );
        assert!("faiss".parse::<RetrievalPolicy>().is_err());
    }
}
