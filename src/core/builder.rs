//! 引擎构建器：统一的组件装配逻辑
//!
//! Store、Dispatcher、FlowController、工具注册表与 Router 全部在这里按配置构造并显式注入，
//! CLI 与测试共用同一套装配，不存在全局单例。

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::EngineError;
use crate::execution::{EventDispatcher, ExecutionSettings, ExecutionStateStore, FlowController};
use crate::router::{Classifier, KeywordClassifier, Planner, Router, RouterSettings, SequentialPlanner};
use crate::tools::{EchoTool, Tool, ToolRegistry};

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    tools: Vec<Arc<dyn Tool>>,
    with_echo_tools: bool,
    classifier: Option<Arc<dyn Classifier>>,
    planner: Option<Arc<dyn Planner>>,
    shutdown_token: Option<CancellationToken>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            with_echo_tools: false,
            classifier: None,
            planner: None,
            shutdown_token: None,
        }
    }

    /// 注册一个工具；同名工具后注册者覆盖
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// 用 echo 工具占位 [router] 段配置的 lookup / insert / search 工具
    pub fn with_echo_tools(mut self, enable: bool) -> Self {
        self.with_echo_tools = enable;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// 关闭令牌：取消时中断所有 Execution
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        if self.with_echo_tools {
            let router = &self.config.router;
            for name in [&router.lookup_tool, &router.insert_tool, &router.search_tool] {
                tools.register(EchoTool::new(name.as_str()));
            }
        }
        for tool in &self.tools {
            tools.register_arc(Arc::clone(tool));
        }
        tools
    }

    pub fn build_controller(&self) -> Arc<FlowController> {
        let store = Arc::new(ExecutionStateStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        let settings = ExecutionSettings::from(&self.config.execution);
        let controller = FlowController::new(store, dispatcher, settings);
        let controller = match &self.shutdown_token {
            Some(token) => controller.with_shutdown_token(token.clone()),
            None => controller,
        };
        Arc::new(controller)
    }

    /// 构建完整引擎
    pub fn build(self) -> Engine {
        let registry = Arc::new(self.build_tool_registry());
        let controller = self.build_controller();
        let classifier: Arc<dyn Classifier> = match &self.classifier {
            Some(classifier) => Arc::clone(classifier),
            None => Arc::new(KeywordClassifier::new()),
        };
        let planner: Arc<dyn Planner> = match &self.planner {
            Some(planner) => Arc::clone(planner),
            None => Arc::new(SequentialPlanner::new(self.config.router.search_tool.clone())),
        };

        tracing::info!(tools = ?registry.tool_names(), "Engine built");

        let router = Router::new(
            Arc::clone(&controller),
            Arc::clone(&registry),
            classifier,
            planner,
            RouterSettings::from(&self.config.router),
        );

        Engine {
            controller,
            registry,
            router,
            config: self.config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 装配好的引擎组件
pub struct Engine {
    pub controller: Arc<FlowController>,
    pub registry: Arc<ToolRegistry>,
    pub router: Router,
    pub config: AppConfig,
}

/// 从默认路径（及可选的显式文件）加载配置并创建 EngineBuilder
pub fn try_create_engine_builder(config_path: Option<PathBuf>) -> Result<EngineBuilder, EngineError> {
    let config = crate::config::load_config(config_path)?;
    Ok(EngineBuilder::new(config))
}

/// 同 try_create_engine_builder，配置加载失败时退回默认值
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    try_create_engine_builder(config_path).unwrap_or_else(|e| {
        tracing::warn!("{}, using defaults", e);
        EngineBuilder::new(AppConfig::default())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ExecutionMode, RouterRequest};

    #[test]
    fn test_echo_tools_follow_router_config() {
        let mut config = AppConfig::default();
        config.router.search_tool = "web".to_string();
        let registry = EngineBuilder::new(config)
            .with_echo_tools(true)
            .with_tool(EchoTool::new("extra"))
            .build_tool_registry();
        assert_eq!(registry.tool_names(), vec!["extra", "insert", "lookup", "web"]);
    }

    #[test]
    fn test_malformed_config_is_a_config_error() {
        use std::io::Write;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[execution]\ntool_timeout_ms = \"soon\"").unwrap();

        let err = try_create_engine_builder(Some(file.path().to_path_buf())).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));

        let fallback = create_engine_builder(Some(file.path().to_path_buf()));
        assert_eq!(fallback.config().execution.tool_timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_build_and_route() {
        let engine = EngineBuilder::new(AppConfig::default())
            .with_echo_tools(true)
            .build();
        let resp = engine.router.handle(RouterRequest::new("search then search")).await;
        assert_eq!(resp.mode, ExecutionMode::Escalate);
        assert_eq!(engine.controller.get_stats().await.total_executions, 1);
    }

    #[tokio::test]
    async fn test_shutdown_token_marks_engine_unhealthy() {
        let token = CancellationToken::new();
        let engine = EngineBuilder::new(AppConfig::default())
            .with_shutdown_token(token.clone())
            .build();
        assert!(engine.controller.health_check().await.healthy);
        token.cancel();
        assert!(!engine.controller.health_check().await.healthy);
    }
}
