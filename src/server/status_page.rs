use chrono::{DateTime, Utc};

use crate::storage::{HistoryRecord, ProviderStats};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const STYLE: &str = r##"
      .card { margin-bottom: 20px; }
      pre { white-space: pre-wrap; max-height: 200px; overflow-y: auto; }
      .history-list { max-height: 400px; overflow-y: auto; }
      .compact-history { font-size: 0.9rem; padding: 4px 8px; border-left: 3px solid #e9ecef; margin-bottom: 4px; }
      .compact-history.success { border-left-color: #28a745; }
      .compact-history.error { border-left-color: #dc3545; }
      .table-fixed { table-layout: fixed; }
      .table-fixed td { white-space: nowrap; overflow: hidden; text-overflow: ellipsis; }
"##;

// 页面脚本是纯静态的：所有动态数据都走 /api/data 等接口
const SCRIPT: &str = r##"
      let lastRefreshTime = 0;
      const MIN_REFRESH_INTERVAL = 15000;

      document.addEventListener('DOMContentLoaded', function() {
        setTimeout(() => setInterval(refreshPageData, 300000), 30000);
        document.getElementById('check-cron').addEventListener('click', checkCronDebug);
      });

      async function checkCronDebug() {
        const debugDiv = document.getElementById('cron-debug-info');
        debugDiv.innerHTML = '<div class="alert alert-info">正在获取定时任务执行信息...</div>';
        try {
          const response = await fetch('/debug-cron');
          if (!response.ok) throw new Error('HTTP错误: ' + response.status);
          const data = await response.json();
          if (data && data.length > 0) {
            let html = '<div class="alert alert-success"><h5>最近的定时任务执行记录</h5><ul>';
            data.forEach(record => {
              const time = new Date(record.timestamp).toLocaleString();
              const successText = record.success ? '是' : '否';
              html += '<li>' + time + ' - API: ' + record.apiName + ' - 成功: ' + successText + '</li>';
            });
            html += '</ul></div>';
            debugDiv.innerHTML = html;
          } else {
            debugDiv.innerHTML = '<div class="alert alert-warning">没有找到最近的定时任务执行记录</div>';
          }
        } catch (error) {
          debugDiv.innerHTML = '<div class="alert alert-danger">获取定时任务执行信息失败: ' + error.message + '</div>';
        }
      }

      async function callApi(apiIndex) {
        const resultDiv = document.getElementById('result');
        resultDiv.innerHTML = '<div class="alert alert-info">正在调用API...</div>';
        try {
          const response = await fetch('/invoke/' + apiIndex);
          const data = await response.json();
          let html = '<div class="alert ' + (data.success ? 'alert-success' : 'alert-danger') + '">';
          if (data.success) {
            html += '<h5>✓ 调用成功 (流式模式)</h5>';
            html += '<p><strong>API:</strong> ' + data.apiName + '</p>';
            html += '<p><strong>问题:</strong> ' + data.question + '</p>';
            html += '<p><strong>耗时:</strong> ' + data.duration + 'ms</p>';
            if (data.streamChunks) {
              html += '<p><strong>流式数据块:</strong> ' + data.streamChunks + '个</p>';
            }
            if (data.rawResponse) {
              html += '<details><summary><strong>调试信息 (点击展开)</strong></summary>';
              html += '<pre class="bg-warning p-2 rounded mt-2" style="font-size: 0.8rem;">' + data.rawResponse + '</pre>';
              html += '</details>';
            }
            html += '<p><strong>回答:</strong></p>';
            html += '<pre class="bg-light p-2 rounded">' + data.answer + '</pre>';
          } else {
            html += '<h5>✗ 调用失败</h5>';
            if (data.apiName) html += '<p><strong>API:</strong> ' + data.apiName + '</p>';
            if (data.question) html += '<p><strong>问题:</strong> ' + data.question + '</p>';
            html += '<p><strong>错误:</strong> ' + data.error + '</p>';
          }
          html += '</div>';
          resultDiv.innerHTML = html;
          setTimeout(refreshPageData, 1000);
        } catch (error) {
          resultDiv.innerHTML = '<div class="alert alert-danger">请求失败: ' + error.message + '</div>';
        }
      }

      async function callAllApis() {
        const resultDiv = document.getElementById('result');
        resultDiv.innerHTML = '<div class="alert alert-info">正在调用所有API...</div>';
        try {
          const response = await fetch('/invoke-all');
          if (!response.ok) throw new Error('HTTP错误: ' + response.status);
          const data = await response.json();
          let html = '<div class="alert alert-success"><h5>API调用结果</h5><ul class="mb-0">';
          data.forEach(result => {
            if (result.success) {
              html += '<li>' + result.apiName + ' 调用成功</li>';
            } else {
              html += '<li>' + result.apiName + ' 调用失败: ' + result.error + '</li>';
            }
          });
          html += '</ul></div>';
          resultDiv.innerHTML = html;
          setTimeout(refreshPageData, 1000);
        } catch (error) {
          resultDiv.innerHTML = '<div class="alert alert-danger">请求失败: ' + error.message + '</div>';
        }
      }

      async function clearHistory() {
        if (confirm('确定要清空所有历史记录吗？')) {
          try {
            const response = await fetch('/api/clear-history', { method: 'POST' });
            const data = await response.json();
            if (data.success) {
              document.getElementById('recent-history').innerHTML = '<p class="text-muted">暂无历史记录</p>';
              alert('历史记录已清空');
            } else {
              alert('清空历史记录失败');
            }
          } catch (error) {
            alert('请求失败: ' + error.message);
          }
        }
      }

      async function updateApiConfigs() {
        if (confirm('确定要更新API配置吗？这将使用配置文件中的最新配置覆盖现有配置。')) {
          try {
            const response = await fetch('/api/update-configs', { method: 'POST' });
            const data = await response.json();
            if (data.success) {
              alert('API配置已更新，页面将刷新');
              window.location.reload();
            } else {
              alert('更新API配置失败: ' + (data.error || '未知错误'));
            }
          } catch (error) {
            alert('请求失败: ' + error.message);
          }
        }
      }

      async function refreshPageData() {
        const now = Date.now();
        if (now - lastRefreshTime < MIN_REFRESH_INTERVAL) return;
        lastRefreshTime = now;
        try {
          const response = await fetch('/api/data');
          if (!response.ok) throw new Error('HTTP错误: ' + response.status);
          const data = await response.json();

          document.getElementById('recent-history').innerHTML = renderHistoryItems(data.history);
          document.getElementById('total-calls').textContent = data.totalCalls;
          document.getElementById('total-success').textContent = data.totalSuccess;
          document.getElementById('success-rate').textContent =
            (data.totalCalls > 0 ? ((data.totalSuccess / data.totalCalls) * 100).toFixed(2) : 0) + '%';

          const table = document.getElementById('api-status-table');
          const rows = table.querySelectorAll('tbody tr');
          data.apiStats.forEach((stat, index) => {
            const row = rows[index];
            if (!row) return;
            const lastCallCell = row.querySelector('.last-call');
            if (lastCallCell && stat.lastCall) {
              lastCallCell.textContent = new Date(stat.lastCall).toLocaleString();
            }
            const nextCallCell = row.querySelector('.next-call');
            if (nextCallCell && stat.nextScheduledCall) {
              nextCallCell.textContent = new Date(stat.nextScheduledCall).toLocaleString();
            }
            const callStatsCell = row.querySelector('.call-stats');
            if (callStatsCell) {
              callStatsCell.textContent = (stat.successCalls || 0) + '/' + (stat.totalCalls || 0);
            }
          });
        } catch (error) {
          console.error('刷新页面数据失败:', error);
        }
      }

      function renderHistoryItems(items) {
        if (!items || items.length === 0) {
          return '<p class="text-muted">暂无历史记录</p>';
        }
        let html = '';
        items.forEach(item => {
          html += '<div class="compact-history ' + (item.success ? 'success' : 'error') + '">';
          html += '<div class="d-flex justify-content-between align-items-center">';
          html += '<span><strong>' + item.apiName + '</strong> · ' + item.question + '</span>';
          html += '<small class="text-muted">' + new Date(item.timestamp).toLocaleTimeString() + '</small>';
          html += '</div>';
          if (item.success) {
            const answer = item.answer || '';
            html += '<div class="text-success">' + answer.substring(0, 80) + (answer.length > 80 ? '...' : '') + '</div>';
          } else {
            html += '<div class="text-danger">错误: ' + (item.error || '未知错误') + '</div>';
          }
          html += '</div>';
        });
        return html;
      }

      document.getElementById('trigger-api').addEventListener('click', () => {
        callApi(document.getElementById('api-select').value);
      });
      document.getElementById('trigger-all').addEventListener('click', callAllApis);
      document.getElementById('clear-history').addEventListener('click', clearHistory);
      document.getElementById('refresh-page').addEventListener('click', refreshPageData);
      document.getElementById('update-configs').addEventListener('click', updateApiConfigs);
      document.querySelectorAll('.call-api-btn').forEach(btn => {
        btn.addEventListener('click', function() { callApi(this.dataset.index); });
      });
"##;

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_time(dt: Option<DateTime<Utc>>, fallback: &str) -> String {
    dt.map(|t| t.format(DATETIME_FORMAT).to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn table_rows(stats: &[ProviderStats]) -> String {
    stats
        .iter()
        .enumerate()
        .map(|(index, s)| {
            let last_call = format_time(s.last_call, "从未调用");
            let next_call = format_time(s.next_scheduled_call, "未安排");
            format!(
                "<tr data-api-index=\"{index}\">\
                   <td title=\"{name}\">{name}</td>\
                   <td class=\"last-call\">{last_call}</td>\
                   <td class=\"next-call\">{next_call}</td>\
                   <td class=\"call-stats\">{success}/{total}</td>\
                   <td><button class=\"btn btn-sm btn-primary call-api-btn\" data-index=\"{index}\">调用</button></td>\
                 </tr>",
                name = escape(&s.config.name),
                success = s.success_calls,
                total = s.total_calls,
            )
        })
        .collect()
}

fn select_options(stats: &[ProviderStats]) -> String {
    stats
        .iter()
        .enumerate()
        .map(|(index, s)| format!("<option value=\"{}\">{}</option>", index, escape(&s.config.name)))
        .collect()
}

fn render_history_items(items: &[HistoryRecord]) -> String {
    if items.is_empty() {
        return "<p class=\"text-muted\">暂无历史记录</p>".to_string();
    }
    items
        .iter()
        .map(|item| {
            let class = if item.success { "success" } else { "error" };
            let detail = if item.success {
                let answer: String = item.answer.chars().take(80).collect();
                let ellipsis = if item.answer.chars().count() > 80 { "..." } else { "" };
                format!("<div class=\"text-success\">{}{}</div>", escape(&answer), ellipsis)
            } else {
                let error = if item.error.is_empty() { "未知错误" } else { &item.error };
                format!("<div class=\"text-danger\">错误: {}</div>", escape(error))
            };
            format!(
                "<div class=\"compact-history {class}\">\
                   <div class=\"d-flex justify-content-between align-items-center\">\
                     <span><strong>{name}</strong> · {question}</span>\
                     <small class=\"text-muted\">{time}</small>\
                   </div>{detail}\
                 </div>",
                name = escape(&item.api_name),
                question = escape(&item.question),
                time = item.timestamp.format("%H:%M:%S"),
            )
        })
        .collect()
}

/// 服务端渲染状态页；之后的增量刷新由页面脚本通过 /api/data 完成
pub(crate) fn render(stats: &[ProviderStats], history: &[HistoryRecord]) -> String {
    let total_calls: i64 = stats.iter().map(|s| s.total_calls).sum();
    let total_success: i64 = stats.iter().map(|s| s.success_calls).sum();
    let success_rate = if total_calls > 0 {
        format!("{:.2}%", total_success as f64 / total_calls as f64 * 100.0)
    } else {
        "0%".to_string()
    };

    let shown = &history[..history.len().min(10)];

    format!(
        r##"<!DOCTYPE html>
<html>
  <head>
    <title>API保活状态</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/bootstrap@5.2.3/dist/css/bootstrap.min.css">
    <style>{style}</style>
  </head>
  <body>
    <div class="container mt-4 mb-5">
      <h1 class="mb-4">API保活状态</h1>

      <div class="row">
        <div class="col-md-6">
          <div class="card">
            <div class="card-header">总体统计</div>
            <div class="card-body">
              <div class="row">
                <div class="col-6">
                  <p>总API数量:</p>
                  <p>总调用次数:</p>
                  <p>总成功次数:</p>
                  <p>总体成功率:</p>
                </div>
                <div class="col-6">
                  <p class="fw-bold">{provider_count}</p>
                  <p class="fw-bold" id="total-calls">{total_calls}</p>
                  <p class="fw-bold" id="total-success">{total_success}</p>
                  <p class="fw-bold" id="success-rate">{success_rate}</p>
                </div>
              </div>
              <p class="text-muted mt-2"><small>数据更新时间: {generated_at}</small></p>
            </div>
          </div>
        </div>

        <div class="col-md-6">
          <div class="card">
            <div class="card-header">API控制</div>
            <div class="card-body">
              <div class="mb-2">
                <select id="api-select" class="form-select">{options}</select>
              </div>
              <div class="d-flex">
                <button id="trigger-api" class="btn btn-primary flex-grow-1 me-2">调用所选API</button>
                <button id="trigger-all" class="btn btn-success flex-grow-1">调用所有API</button>
              </div>
              <div class="mt-2 d-flex">
                <button id="clear-history" class="btn btn-outline-danger flex-grow-1 me-2">清空历史</button>
                <button id="refresh-page" class="btn btn-outline-secondary flex-grow-1">刷新数据</button>
              </div>
              <div class="mt-2">
                <button id="update-configs" class="btn btn-outline-primary w-100">更新API配置</button>
              </div>
            </div>
          </div>
        </div>
      </div>

      <div class="card mt-4">
        <div class="card-header">API状态</div>
        <div class="card-body">
          <div class="table-responsive">
            <table class="table table-striped table-fixed" id="api-status-table">
              <thead>
                <tr>
                  <th width="25%">API名称</th>
                  <th width="25%">上次调用</th>
                  <th width="25%">下次调用</th>
                  <th width="15%">成功/总调用</th>
                  <th width="10%">操作</th>
                </tr>
              </thead>
              <tbody>{rows}</tbody>
            </table>
          </div>
        </div>
      </div>

      <div class="card mt-4">
        <div class="card-header d-flex justify-content-between align-items-center">
          <span>最近调用历史</span>
          <span class="badge bg-secondary">{history_count}条记录</span>
        </div>
        <div class="card-body p-0">
          <div class="history-list p-3" id="recent-history">{history_html}</div>
        </div>
      </div>

      <div id="result" class="mt-3"></div>

      <div class="card mt-4">
        <div class="card-header">定时任务调试信息</div>
        <div class="card-body">
          <div id="debug-info">
            <button id="check-cron" class="btn btn-info">查看最近执行情况</button>
            <div id="cron-debug-info" class="mt-3"></div>
          </div>
        </div>
      </div>
    </div>

    <script>{script}</script>
  </body>
</html>
"##,
        style = STYLE,
        script = SCRIPT,
        provider_count = stats.len(),
        total_calls = total_calls,
        total_success = total_success,
        success_rate = success_rate,
        generated_at = Utc::now().format(DATETIME_FORMAT),
        options = select_options(stats),
        rows = table_rows(stats),
        history_count = history.len(),
        history_html = render_history_items(shown),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProviderConfig;

    fn sample_stats() -> Vec<ProviderStats> {
        vec![ProviderStats {
            total_calls: 4,
            success_calls: 3,
            failed_calls: 1,
            last_call: None,
            next_scheduled_call: None,
            config: ProviderConfig {
                name: "示例<API>".to_string(),
                model: "gpt-4o-mini".to_string(),
                url: "https://api.example.com".to_string(),
                api_key: "sk-test".to_string(),
            },
        }]
    }

    #[test]
    fn render_escapes_provider_names() {
        let page = render(&sample_stats(), &[]);
        assert!(page.contains("示例&lt;API&gt;"));
        assert!(!page.contains("示例<API>"));
        assert!(page.contains("75.00%"));
    }

    #[test]
    fn empty_history_renders_placeholder() {
        assert!(render_history_items(&[]).contains("暂无历史记录"));
    }

    #[test]
    fn failed_history_item_shows_error() {
        let item = HistoryRecord {
            id: None,
            api_index: 0,
            api_name: "x".into(),
            question: "Hi".into(),
            answer: String::new(),
            success: false,
            error: "API请求失败: 500".into(),
            duration_ms: 0,
            timestamp: Utc::now(),
        };
        let html = render_history_items(std::slice::from_ref(&item));
        assert!(html.contains("compact-history error"));
        assert!(html.contains("API请求失败: 500"));
    }
}
