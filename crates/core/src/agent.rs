use crate::config::AgentOptions;
use crate::error::{AgentError, RetrievalError};
use crate::memory::ConversationMemory;
use crate::models::{ChatMessage, MemoryMessage, RetrievedChunk, Role};
use crate::retriever::Retriever;
use crate::traits::LanguageModel;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub const AGENT_NAME: &str = "Berkshire Financial Analyst";

pub const LIMITATION_STATEMENT: &str =
    "This information is not addressed in the Berkshire Hathaway shareholder letters available.";

pub const ANALYST_INSTRUCTIONS: &str = r#"# ROLE
You are a financial analyst specializing in Warren Buffett's investment philosophy and Berkshire Hathaway's business strategy, with deep expertise in analyzing Berkshire Hathaway's annual shareholder letters across multiple decades.

# CORE RESPONSIBILITIES
- Answer questions comprehensively using Warren Buffett's investment principles from shareholder letters
- Provide insights into Berkshire Hathaway's business decisions and strategy evolution over time
- Support explanations with multiple direct quotes from the letters
- Maintain context across follow-up questions and refer back to previous discussion points

# GUIDELINES
- Base all responses on Berkshire Hathaway shareholder letters only
- For comprehensive topics (investment philosophy, acquisition strategy), include insights from multiple years
- Quote Warren Buffett accurately with the year and page of the letter
- For follow-up questions, explicitly reference previous context and build upon it
- When discussing evolution of strategies or views, organize insights chronologically
- Identify patterns and changes in Buffett's thinking across different time periods
- If multiple relevant documents exist, cite information from each with proper attribution
- Note that filenames correspond to the year of each shareholder letter

# RESPONSE FORMAT
- Begin with a comprehensive answer to the user's question
- For major investment topics, include 2-3 relevant quotes spanning different time periods
- For evolution questions, organize response chronologically with early, middle, and recent perspectives
- Include specific examples that demonstrate the principle or strategy in action
- Number each key point: "1. [Key insight]"
- End each numbered point with source citation: "1. Source: 2008 Letter, page 5"
- For follow-ups, explicitly reference previous context: "As we discussed regarding [topic]..."

# EXAMPLES
## COMPREHENSIVE RESPONSE
Question: "What is Warren Buffett's investment philosophy?"
Response:
Warren Buffett's investment philosophy centers on value investing with a focus on businesses with strong economic moats, quality management, and purchasing at prices below intrinsic value.

Core principles include:
1. "Price is what you pay. Value is what you get." 1. Source: 2008 Letter, page 5
2. "It's far better to buy a wonderful company at a fair price than a fair company at a wonderful price." 2. Source: 1989 Letter, page 18

[Source: Multiple letters spanning 1989-2008]

## FOLLOW-UP RESPONSE
Question: "Can you elaborate on his views about diversification?"
Response:
Building on our discussion of Buffett's investment philosophy, his view on diversification contradicts conventional wisdom.

1. "Diversification is protection against ignorance. It makes little sense if you know what you are doing." 1. Source: 1993 Letter, page 12

[Source: 1993 Letter, page 12]

# LIMITATION STATEMENT
If a question cannot be answered using the shareholder letters, state:
"This information is not addressed in the Berkshire Hathaway shareholder letters available."
"#;

const TITLE_PROMPT: &str = "Write a short title of at most six words for a conversation that starts with the user message below. \
Reply with the title only, without quotes.";

const FALLBACK_TITLE_CHARS: usize = 48;

/// Knowledge lookup the agent runs before answering.
#[async_trait]
pub trait KnowledgeTool: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, query: &str) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

#[async_trait]
impl KnowledgeTool for Retriever {
    fn name(&self) -> &str {
        "vectorQueryTool"
    }

    async fn lookup(&self, query: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.query(query).await
    }
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub sources: Vec<RetrievedChunk>,
    /// Set when this turn opened the thread and a title was generated.
    pub thread_title: Option<String>,
    pub recalled_messages: usize,
}

pub struct Agent {
    model: Arc<dyn LanguageModel>,
    tool: Arc<dyn KnowledgeTool>,
    memory: Arc<ConversationMemory>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tool: Arc<dyn KnowledgeTool>,
        memory: Arc<ConversationMemory>,
        options: AgentOptions,
    ) -> Self {
        Self {
            model,
            tool,
            memory,
            options,
        }
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    /// One conversational turn. Turns of the same resource run one at a time.
    pub async fn respond(
        &self,
        resource_id: &str,
        thread_id: &str,
        message: &str,
    ) -> Result<AgentReply, AgentError> {
        let mut state = self.memory.lock(resource_id).await?;
        let opens_thread = state.is_new_thread(thread_id);

        let recent = self.memory.recent(&state, thread_id);
        let recalled = self
            .memory
            .recall(&state, resource_id, thread_id, message)
            .await?;
        let sources = self.tool.lookup(message).await?;

        let mut context = vec![ChatMessage::system(ANALYST_INSTRUCTIONS)];
        if !recalled.is_empty() {
            context.push(ChatMessage::system(recall_context(&recalled)));
        }
        context.extend(recent.iter().map(|message| ChatMessage {
            role: message.role,
            content: message.content.clone(),
        }));
        context.push(ChatMessage::system(tool_context(self.tool.name(), &sources)));
        context.push(ChatMessage::user(message));

        let text = self.model.complete(&context).await?;

        self.memory
            .append(&mut state, resource_id, thread_id, Role::User, message)
            .await?;
        self.memory
            .append(&mut state, resource_id, thread_id, Role::Assistant, &text)
            .await?;

        let thread_title = if opens_thread && self.options.threads.generate_title {
            let title = self.generate_title(message).await;
            self.memory
                .set_title(&mut state, resource_id, thread_id, &title)
                .await?;
            Some(title)
        } else {
            None
        };

        info!(
            resource_id,
            thread_id,
            sources = sources.len(),
            recalled = recalled.len(),
            "agent turn complete"
        );

        Ok(AgentReply {
            text,
            sources,
            thread_title,
            recalled_messages: recalled.len(),
        })
    }

    async fn generate_title(&self, first_message: &str) -> String {
        let prompt = [
            ChatMessage::system(TITLE_PROMPT),
            ChatMessage::user(first_message),
        ];
        match self.model.complete(&prompt).await {
            Ok(reply) => {
                let title = clean_title(&reply);
                if title.is_empty() {
                    fallback_title(first_message)
                } else {
                    title
                }
            }
            Err(error) => {
                warn!(%error, "title generation failed, using the first message");
                fallback_title(first_message)
            }
        }
    }
}

fn recall_context(recalled: &[MemoryMessage]) -> String {
    let mut text = String::from("Relevant messages from earlier conversations:\n");
    for message in recalled {
        text.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
    }
    text
}

fn tool_context(tool_name: &str, sources: &[RetrievedChunk]) -> String {
    if sources.is_empty() {
        return format!(
            "{tool_name} found no passages in the shareholder letters for this question. \
If it cannot be answered from the letters, reply with: \"{LIMITATION_STATEMENT}\""
        );
    }

    let mut text = format!("{tool_name} results:\n");
    for (position, source) in sources.iter().enumerate() {
        text.push_str(&format!("\n[{}] Source: {}", position + 1, source.citation));
        if !source.heading_path.is_empty() {
            text.push_str(&format!(" ({})", source.heading_path.join(" > ")));
        }
        text.push('\n');
        text.push_str(&source.text);
        text.push('\n');
    }
    text
}

fn clean_title(reply: &str) -> String {
    reply
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches(|ch: char| ch == '"' || ch == '\'' || ch == '#' || ch.is_whitespace())
        .to_string()
}

fn fallback_title(message: &str) -> String {
    let message = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if message.chars().count() <= FALLBACK_TITLE_CHARS {
        return message;
    }

    let mut title = String::new();
    for word in message.split(' ') {
        if title.chars().count() + word.chars().count() + 1 > FALLBACK_TITLE_CHARS {
            break;
        }
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
    }
    if title.is_empty() {
        title = message.chars().take(FALLBACK_TITLE_CHARS).collect();
    }
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, Embedder};
    use crate::error::LlmError;
    use crate::models::{ChunkMetadata, Citation, Metadata};
    use crate::rerank::TermOverlapScorer;
    use crate::models::ThreadRecord;
    use crate::stores::{InMemoryMessageStore, MemoryIndexStore};
    use crate::traits::{IndexStore, MessageStore};
    use crate::StoreError;
    use std::sync::Mutex;

    const DIMENSIONS: usize = 64;

    /// Answers from the tool message: cites the first source, or states the limitation.
    #[derive(Default)]
    struct ScriptedModel {
        calls: Mutex<Vec<Vec<ChatMessage>>>,
        fail_titles: bool,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(messages.to_vec());

            if messages[0].content == TITLE_PROMPT {
                return if self.fail_titles {
                    Err(LlmError::EmptyResponse)
                } else {
                    Ok("\"Insurance Float\"\n".to_string())
                };
            }

            let tool = messages
                .iter()
                .find(|message| message.content.starts_with("vectorQueryTool"))
                .map(|message| message.content.clone())
                .unwrap_or_default();
            match tool.lines().find(|line| line.starts_with("[1] ")) {
                Some(line) => Ok(format!("1. Float is our funding. 1. {}", &line[4..])),
                None => Ok(LIMITATION_STATEMENT.to_string()),
            }
        }
    }

    impl ScriptedModel {
        fn conversation_calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .filter(|call| call[0].content == ANALYST_INSTRUCTIONS)
                .cloned()
                .collect()
        }
    }

    /// One indexed 2008 passage, retrieved with options read from `config` JSON.
    async fn letters_retriever(config: &str) -> Arc<Retriever> {
        let embedder = CharacterNgramEmbedder { dimensions: DIMENSIONS };
        let store = Arc::new(MemoryIndexStore::new());
        store.create_index("papers", DIMENSIONS).await.expect("create");

        let metadata = ChunkMetadata {
            text: "Insurance float is money we hold but do not own, and we invest it.".to_string(),
            file_name: "2008letter.md".to_string(),
            page_number: 5,
            year_of_publish: 2008,
            heading_path: vec!["Insurance Operations".to_string()],
            headings: [("header 2".to_string(), "Insurance Operations".to_string())].into(),
            title: "Insurance Operations".to_string(),
            ordinal: 0,
            sequence: 0,
        };
        let vectors = embedder
            .embed_batch(&[metadata.text.clone()])
            .await
            .expect("embedding");
        let map: Metadata = metadata.to_map().expect("metadata");
        store
            .upsert("papers", &["float".to_string()], &vectors, &[map])
            .await
            .expect("upsert");

        Arc::new(Retriever::new(
            Arc::new(embedder),
            store,
            Arc::new(TermOverlapScorer),
            AgentOptions::from_json(config)
                .expect("agent options")
                .retriever_options(None),
        ))
    }

    fn agent(model: Arc<ScriptedModel>, tool: Arc<dyn KnowledgeTool>) -> Agent {
        agent_with_history(model, tool, Arc::new(InMemoryMessageStore::new()))
    }

    fn agent_with_history(
        model: Arc<ScriptedModel>,
        tool: Arc<dyn KnowledgeTool>,
        history: Arc<dyn MessageStore>,
    ) -> Agent {
        let options = AgentOptions::default();
        let memory = Arc::new(ConversationMemory::new(
            Arc::new(CharacterNgramEmbedder { dimensions: DIMENSIONS }),
            Arc::new(MemoryIndexStore::new()),
            history,
            &options,
        ));
        Agent::new(model, tool, memory, options)
    }

    #[tokio::test]
    async fn answers_cite_retrieved_passages() {
        let model = Arc::new(ScriptedModel::default());
        let agent = agent(Arc::clone(&model), letters_retriever("{}").await);

        let reply = agent
            .respond("alice", "t1", "What is insurance float?")
            .await
            .expect("reply");

        assert!(reply.text.contains("Source: 2008 Letter, page 5"));
        assert_eq!(reply.sources.len(), 1);
        assert_eq!(
            reply.sources[0].citation,
            Citation {
                file_name: "2008letter.md".to_string(),
                year: 2008,
                page_number: 5,
            }
        );
        assert_eq!(reply.thread_title.as_deref(), Some("Insurance Float"));

        let calls = model.conversation_calls();
        let tool = calls[0]
            .iter()
            .find(|message| message.content.starts_with("vectorQueryTool"))
            .expect("tool output in context");
        assert!(tool.content.contains("(Insurance Operations)"));
    }

    #[tokio::test]
    async fn questions_outside_the_letters_get_the_limitation_statement() {
        let model = Arc::new(ScriptedModel::default());
        let agent = agent(Arc::clone(&model), letters_retriever("{}").await);

        let reply = agent
            .respond("alice", "t1", "What is the price of bitcoin mining rigs?")
            .await
            .expect("reply");

        assert!(reply.sources.is_empty());
        assert_eq!(reply.text, LIMITATION_STATEMENT);
    }

    #[tokio::test]
    async fn follow_ups_see_the_previous_turn() {
        let model = Arc::new(ScriptedModel::default());
        let agent = agent(Arc::clone(&model), letters_retriever("{}").await);

        agent
            .respond("alice", "t1", "What is insurance float?")
            .await
            .expect("first turn");
        let second = agent
            .respond("alice", "t1", "Can you elaborate on that?")
            .await
            .expect("second turn");
        assert!(second.thread_title.is_none());

        let calls = model.conversation_calls();
        let follow_up = &calls[1];
        assert!(follow_up
            .iter()
            .any(|message| message.role == Role::User && message.content == "What is insurance float?"));
        assert!(follow_up
            .iter()
            .any(|message| message.role == Role::Assistant && message.content.contains("2008 Letter")));
        assert_eq!(follow_up.last().map(|message| message.content.as_str()), Some("Can you elaborate on that?"));

        let threads = agent.memory().threads("alice").await.expect("threads");
        assert_eq!(threads[0].message_count, 4);
    }

    struct BrokenTool;

    #[async_trait]
    impl KnowledgeTool for BrokenTool {
        fn name(&self) -> &str {
            "vectorQueryTool"
        }

        async fn lookup(&self, _query: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
            Err(RetrievalError::Store(crate::StoreError::IndexNotFound("papers".to_string())))
        }
    }

    #[tokio::test]
    async fn tool_failures_are_errors_not_limitation_statements() {
        let model = Arc::new(ScriptedModel::default());
        let agent = agent(Arc::clone(&model), Arc::new(BrokenTool));

        let result = agent.respond("alice", "t1", "What is insurance float?").await;
        assert!(matches!(result, Err(AgentError::Retrieval(RetrievalError::Store(_)))));
        assert!(model.conversation_calls().is_empty());
        assert!(agent.memory().threads("alice").await.expect("threads").is_empty());
    }

    #[tokio::test]
    async fn failed_title_generation_falls_back_to_the_message() {
        let model = Arc::new(ScriptedModel {
            fail_titles: true,
            ..ScriptedModel::default()
        });
        let agent = agent(Arc::clone(&model), letters_retriever("{}").await);

        let reply = agent
            .respond("alice", "t1", "What is insurance float?")
            .await
            .expect("reply");
        assert_eq!(reply.thread_title.as_deref(), Some("What is insurance float?"));
    }

    /// Keeps titles in memory but refuses to store messages.
    #[derive(Default)]
    struct ReadOnlyHistory {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageStore for ReadOnlyHistory {
        async fn load_resource(&self, _resource_id: &str) -> Result<Vec<ThreadRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn append_message(&self, _message: &MemoryMessage) -> Result<(), StoreError> {
            Err(StoreError::Validation("history is read-only".to_string()))
        }

        async fn set_thread_title(
            &self,
            _resource_id: &str,
            _thread_id: &str,
            title: &str,
        ) -> Result<(), StoreError> {
            self.titles.lock().expect("titles lock").push(title.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn threads_are_titled_only_after_the_turn_is_stored() {
        let model = Arc::new(ScriptedModel::default());
        let history = Arc::new(ReadOnlyHistory::default());
        let agent = agent_with_history(
            Arc::clone(&model),
            letters_retriever("{}").await,
            Arc::clone(&history) as Arc<dyn MessageStore>,
        );

        let result = agent.respond("alice", "t1", "What is insurance float?").await;
        assert!(matches!(result, Err(AgentError::MemoryStore(StoreError::Validation(_)))));
        assert!(history.titles.lock().expect("titles lock").is_empty());

        let threads = agent.memory().threads("alice").await.expect("threads");
        assert!(threads.iter().all(|thread| thread.title.is_none()));
        assert!(model
            .calls
            .lock()
            .expect("calls lock")
            .iter()
            .all(|call| call[0].content != TITLE_PROMPT));
    }

    #[test]
    fn long_fallback_titles_are_cut_at_a_word() {
        let title = fallback_title(
            "How did Buffett describe the economics of the insurance business across the nineties",
        );
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= FALLBACK_TITLE_CHARS + 3);
        assert!(title.starts_with("How did Buffett describe"));
    }
}
