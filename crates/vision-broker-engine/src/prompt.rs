//! ChatML prompt assembly (Qwen2-VL role delimiters).

use vision_broker_config::PromptConfig;

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

/// Builds the single-turn prompt sent with every request.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system_prompt: String,
    image_placeholder: String,
    instruction: String,
}

impl PromptTemplate {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            image_placeholder: config.image_placeholder.clone(),
            instruction: config.instruction.clone(),
        }
    }

    /// `<|im_start|>system\n{system}<|im_end|>\n<|im_start|>user\n[{image}]{instruction}<|im_end|>\n<|im_start|>assistant\n`
    pub fn render(&self, with_image: bool) -> String {
        let mut p = String::new();
        p.push_str(IM_START);
        p.push_str("system\n");
        p.push_str(&self.system_prompt);
        p.push_str(IM_END);
        p.push('\n');

        p.push_str(IM_START);
        p.push_str("user\n");
        if with_image {
            p.push_str(&self.image_placeholder);
        }
        p.push_str(&self.instruction);
        p.push_str(IM_END);
        p.push('\n');

        p.push_str(IM_START);
        p.push_str("assistant\n");
        p
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(&PromptConfig::default())
    }
}
