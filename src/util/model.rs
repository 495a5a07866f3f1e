/// 规范化模型 ID：去除空白与 `models/` 前缀。
pub fn canonical_model_id(model: &str) -> String {
    let m = model.trim();
    let m = m.strip_prefix("models/").unwrap_or(m);
    m.trim().to_string()
}

/// 规范化 provider 标签：统一为小写去空白形式（所有比较都基于该形式）。
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

/// 去除模型名的 thinking 后缀：`"name(...)"` → `"name"`。
///
/// 客户端工具用括号后缀携带 thinking 配置；转发给上游前必须还原为裸模型名。
pub fn strip_thinking_suffix(model: &str) -> String {
    let m = canonical_model_id(model);
    if let Some(idx) = m.find('(')
        && m.ends_with(')')
    {
        return m[..idx].trim().to_string();
    }
    m
}

/// 根据模型名前缀推断 provider（用于非虚拟模型的单链路由）。
pub fn infer_provider(model: &str) -> Option<&'static str> {
    let m = canonical_model_id(model).to_lowercase();
    if m.starts_with("claude-") {
        return Some("claude");
    }
    if m.starts_with("gemini-") {
        return Some("gemini");
    }
    if m.starts_with("gpt-") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") {
        return Some("codex");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_thinking_suffix_restores_bare_model() {
        assert_eq!(strip_thinking_suffix("claude-3-opus(high)"), "claude-3-opus");
        assert_eq!(
            strip_thinking_suffix("models/gemini-2.0-pro(budget=1024)"),
            "gemini-2.0-pro"
        );
        assert_eq!(strip_thinking_suffix("claude-3-opus"), "claude-3-opus");
        // 括号不在结尾：不是 thinking 后缀，原样保留。
        assert_eq!(strip_thinking_suffix("weird(x)y"), "weird(x)y");
    }

    #[test]
    fn normalize_provider_lowercases_and_trims() {
        assert_eq!(normalize_provider("  Claude "), "claude");
        assert_eq!(normalize_provider("GEMINI"), "gemini");
    }

    #[test]
    fn infer_provider_by_prefix() {
        assert_eq!(infer_provider("claude-3-opus"), Some("claude"));
        assert_eq!(infer_provider("gemini-2.0-pro"), Some("gemini"));
        assert_eq!(infer_provider("gpt-4o"), Some("codex"));
        assert_eq!(infer_provider("unknown-model"), None);
    }
}
