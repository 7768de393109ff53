use std::collections::HashMap;

pub struct I18n {
    translations: HashMap<String, HashMap<String, String>>,
    current_lang: String,
}

fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

const EN: &[(&str, &str)] = &[
    // Runtime messages
    ("command_saved", "Command saved as #{0}"),
    ("command_completed", "Command #{0} completed"),
    ("command_exit_code", "Command exited with code {0}"),
    ("rerunning", "Running:"),
    ("captured_output", "Captured output:"),
    ("error_prefix", "Error:"),
    ("warning_prefix", "Warning:"),
    ("aborted", "Aborted"),
    ("confirm_hint", "[y/N] "),
    ("never", "never"),
    // Listing
    ("no_commands", "No commands found"),
    ("no_favorites", "No favorite commands"),
    ("no_tags", "No tags yet"),
    ("no_chains", "No chains defined"),
    ("no_backups", "No backups found"),
    ("no_search_results", "No commands match '{0}'"),
    ("search_results", "Found {0} matching commands:"),
    ("tags_title", "Tags:"),
    ("label_description", "Description"),
    ("label_tags", "Tags"),
    ("label_directory", "Directory"),
    ("label_runs", "Runs"),
    ("label_success_rate", "Success rate"),
    ("label_last_exit", "Last exit code"),
    ("label_created", "Created"),
    ("label_steps", "Steps"),
    ("label_depends_on", "Depends on"),
    ("label_last_run", "Last run"),
    ("label_history_file", "History file"),
    ("label_backup_dir", "Backup directory"),
    ("label_config_file", "Config file"),
    // Statistics
    ("stats_title", "Command statistics:"),
    ("stats_commands", "Saved commands"),
    ("stats_total_runs", "Total runs"),
    ("stats_favorites", "Favorites"),
    ("stats_top_tags", "Most used tags"),
    ("stats_top_commands", "Most common commands"),
    // Editing
    ("favorite_set", "Command #{0} marked as favorite"),
    ("favorite_cleared", "Command #{0} is no longer a favorite"),
    ("description_updated", "Description of command #{0} updated"),
    ("tags_updated", "Tags of command #{0} updated"),
    ("command_updated", "Command #{0} updated"),
    ("edit_title", "Editing command (press Enter to keep the current value)"),
    ("edit_current_command", "Current command: {0}"),
    ("edit_prompt_command", "New command: "),
    ("edit_current_description", "Current description: {0}"),
    ("edit_prompt_description", "New description: "),
    ("edit_current_tags", "Current tags: {0}"),
    ("edit_prompt_add_tags", "Tags to add (comma separated): "),
    ("edit_prompt_remove_tags", "Tags to remove (comma separated): "),
    ("edit_undone", "Undid {0} of command #{1}"),
    ("edit_kind_tags", "tag change"),
    ("edit_kind_interactive", "interactive edit"),
    ("edit_kind_description", "description change"),
    ("confirm_remove", "Remove {0} command(s)?"),
    ("commands_removed", "Removed {0} command(s)"),
    ("invalid_id", "invalid command ID '{0}'"),
    ("no_ids_given", "no command IDs given"),
    ("commands_imported", "Imported {0} command(s)"),
    ("commands_exported", "Exported {0} command(s) to {1}"),
    // Chains
    ("chain_created", "Chain #{0} created"),
    ("chain_starting", "Running chain #{0}"),
    ("chain_succeeded", "Chain #{0} completed successfully"),
    // Backups and integrity
    ("backup_created", "Backup written to {0}"),
    ("confirm_restore", "Replace current commands and chains with {0}?"),
    ("backup_restored", "Restored {0} command(s) and {1} chain(s) (written by version {2})"),
    ("integrity_ok", "No integrity issues found"),
    ("integrity_issues", "{0} integrity issue(s) found"),
    ("integrity_repaired", "Applied {0} repair(s)"),
    // Error messages
    ("error_execute_command", "Failed to execute command"),
    ("error_current_dir", "Failed to read the current directory"),
    ("error_read_file", "Failed to read {0}"),
    ("error_parse_file", "Failed to parse {0}"),
];

const ZH: &[(&str, &str)] = &[
    // 运行信息
    ("command_saved", "命令已保存为 #{0}"),
    ("command_completed", "命令 #{0} 执行完成"),
    ("command_exit_code", "命令退出码为 {0}"),
    ("rerunning", "正在运行:"),
    ("captured_output", "捕获的输出:"),
    ("error_prefix", "错误:"),
    ("warning_prefix", "警告:"),
    ("aborted", "已取消"),
    ("confirm_hint", "[y/N] "),
    ("never", "从未"),
    // 列表
    ("no_commands", "没有找到命令"),
    ("no_favorites", "没有收藏的命令"),
    ("no_tags", "还没有标签"),
    ("no_chains", "没有定义命令链"),
    ("no_backups", "没有找到备份"),
    ("no_search_results", "没有匹配 '{0}' 的命令"),
    ("search_results", "找到 {0} 条匹配的命令:"),
    ("tags_title", "标签:"),
    ("label_description", "描述"),
    ("label_tags", "标签"),
    ("label_directory", "目录"),
    ("label_runs", "运行次数"),
    ("label_success_rate", "成功率"),
    ("label_last_exit", "最近退出码"),
    ("label_created", "创建时间"),
    ("label_steps", "步骤"),
    ("label_depends_on", "依赖"),
    ("label_last_run", "最近运行"),
    ("label_history_file", "历史文件"),
    ("label_backup_dir", "备份目录"),
    ("label_config_file", "配置文件"),
    // 统计
    ("stats_title", "命令统计:"),
    ("stats_commands", "已保存命令"),
    ("stats_total_runs", "总运行次数"),
    ("stats_favorites", "收藏"),
    ("stats_top_tags", "常用标签"),
    ("stats_top_commands", "常用命令"),
    // 编辑
    ("favorite_set", "命令 #{0} 已收藏"),
    ("favorite_cleared", "命令 #{0} 已取消收藏"),
    ("description_updated", "命令 #{0} 的描述已更新"),
    ("tags_updated", "命令 #{0} 的标签已更新"),
    ("command_updated", "命令 #{0} 已更新"),
    ("edit_title", "编辑命令(直接回车保留当前值)"),
    ("edit_current_command", "当前命令: {0}"),
    ("edit_prompt_command", "新命令: "),
    ("edit_current_description", "当前描述: {0}"),
    ("edit_prompt_description", "新描述: "),
    ("edit_current_tags", "当前标签: {0}"),
    ("edit_prompt_add_tags", "要添加的标签(逗号分隔): "),
    ("edit_prompt_remove_tags", "要删除的标签(逗号分隔): "),
    ("edit_undone", "已撤销命令 #{1} 的{0}"),
    ("edit_kind_tags", "标签修改"),
    ("edit_kind_interactive", "交互式编辑"),
    ("edit_kind_description", "描述修改"),
    ("confirm_remove", "删除 {0} 条命令?"),
    ("commands_removed", "已删除 {0} 条命令"),
    ("invalid_id", "无效的命令 ID '{0}'"),
    ("no_ids_given", "未提供命令 ID"),
    ("commands_imported", "已导入 {0} 条命令"),
    ("commands_exported", "已导出 {0} 条命令到 {1}"),
    // 命令链
    ("chain_created", "命令链 #{0} 已创建"),
    ("chain_starting", "正在运行命令链 #{0}"),
    ("chain_succeeded", "命令链 #{0} 执行成功"),
    // 备份与完整性
    ("backup_created", "备份已写入 {0}"),
    ("confirm_restore", "用 {0} 替换当前的命令和命令链?"),
    ("backup_restored", "已恢复 {0} 条命令和 {1} 个命令链(版本 {2})"),
    ("integrity_ok", "未发现完整性问题"),
    ("integrity_issues", "发现 {0} 个完整性问题"),
    ("integrity_repaired", "已修复 {0} 处"),
    // 错误信息
    ("error_execute_command", "执行命令失败"),
    ("error_current_dir", "无法读取当前目录"),
    ("error_read_file", "无法读取 {0}"),
    ("error_parse_file", "无法解析 {0}"),
];

impl I18n {
    pub fn new(lang: &str) -> Self {
        let mut translations = HashMap::new();
        translations.insert("en".to_string(), table(EN));
        translations.insert("zh".to_string(), table(ZH));

        // 确定语言 - 支持多种语言代码格式
        let lang = lang.to_lowercase();
        let effective_lang = if lang.starts_with("zh") || lang == "cn" || lang == "chinese" {
            "zh"
        } else {
            "en"
        };

        Self {
            translations,
            current_lang: effective_lang.to_string(),
        }
    }

    /// Looks up a message, falling back to English and then to the key itself.
    pub fn t(&self, key: &str) -> String {
        [self.current_lang.as_str(), "en"]
            .iter()
            .find_map(|lang| self.translations.get(*lang)?.get(key))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    pub fn t_format(&self, key: &str, args: &[&str]) -> String {
        let mut result = self.t(key);
        for (i, arg) in args.iter().enumerate() {
            result = result.replace(&format!("{{{}}}", i), arg);
        }
        result
    }
}
