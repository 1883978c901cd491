#[derive(Clone, Copy, PartialEq, Debug, clap::ValueEnum)]
pub enum Language {
    En,
    Zh,
}

pub struct Dict {
    pub ready_to_flash: &'static str,
    pub no_device: &'static str,
    pub scanning: &'static str,
    pub port: &'static str,
    pub connected: &'static str,

    // Flash stages
    pub erasing: &'static str,
    pub writing: &'static str,
    pub resetting: &'static str,
    pub flash_complete: &'static str,
    pub flash_failed: &'static str,
    pub retry_required: &'static str,
    pub flashes_completed: &'static str,

    pub busy_ignored: &'static str,
    pub warning: &'static str,
    pub error: &'static str,
    pub unknown_command: &'static str,
    pub help: &'static str,
}

pub const EN_DICT: Dict = Dict {
    ready_to_flash: "Ready to flash.",
    no_device: "No ESP32 detected.",
    scanning: "Ports",
    port: "Port",
    connected: "Connected",

    erasing: "Erasing flash...",
    writing: "Writing firmware...",
    resetting: "Resetting ESP32...",
    flash_complete: "✔ Flash complete.",
    flash_failed: "❌ Flash failed.",
    retry_required: "Press r to reset and try again.",
    flashes_completed: "Flashes Completed",

    busy_ignored: "Busy, request ignored.",
    warning: "Warning",
    error: "Error",
    unknown_command: "Unknown command",
    help: "f = flash, r = reset, n = next port, p <path> = use port, l = list ports, c = reload config, q = quit",
};

pub const ZH_DICT: Dict = Dict {
    ready_to_flash: "就绪，可以烧录。",
    no_device: "未检测到 ESP32。",
    scanning: "端口",
    port: "端口",
    connected: "已连接",

    erasing: "正在擦除 Flash...",
    writing: "正在写入固件...",
    resetting: "正在复位 ESP32...",
    flash_complete: "✔ 烧录完成。",
    flash_failed: "❌ 烧录失败。",
    retry_required: "按 r 复位后重试。",
    flashes_completed: "已完成烧录",

    busy_ignored: "正在忙，已忽略该请求。",
    warning: "警告",
    error: "错误",
    unknown_command: "未知指令",
    help: "f = 烧录, r = 复位, n = 下一个端口, p <路径> = 指定端口, l = 列出端口, c = 重新加载配置, q = 退出",
};

pub fn get_dict(lang: Language) -> Dict {
    match lang {
        Language::En => EN_DICT,
        Language::Zh => ZH_DICT,
    }
}
