//! Monitoring endpoints: raw metric series and the HTML dashboard.

use salvo::prelude::*;
use serde_json::json;

use grps_core::monitor::MetricsRead;

use super::state_of;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `?name=metric` → JSON time series or CDF points.
#[handler]
pub async fn series(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    let name = req.query::<String>("name").unwrap_or_default();
    match state.monitor.read(&name) {
        None => res.render(Text::Plain("key not found")),
        Some(MetricsRead::Cdf(points)) => {
            let data: Vec<_> = points
                .iter()
                .map(|&(percent, value)| json!([percent, round2(value)]))
                .collect();
            res.render(Json(json!({ "label": "cdf", "data": data })));
        }
        Some(MetricsRead::Trend(values)) => {
            let data: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, &value)| json!([i, round2(value)]))
                .collect();
            res.render(Json(json!({ "label": "trend", "data": data })));
        }
    }
}

/// The metrics dashboard. Also served at `/`.
#[handler]
pub async fn metrics_page(depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    let names = state.monitor.metric_names();
    let charts: String = names
        .iter()
        .map(|name| {
            format!(
                "<div class=\"chart\"><h3>{name}</h3><canvas data-metric=\"{name}\" \
                 width=\"640\" height=\"160\"></canvas></div>\n"
            )
        })
        .collect();
    let page = DASHBOARD_HTML.replace("{{charts}}", &charts);
    res.render(Text::Html(page));
}

#[handler]
pub async fn jquery_min_js(res: &mut Response) {
    res.render(Text::Js(JQUERY_MIN_JS));
}

#[handler]
pub async fn flot_min_js(res: &mut Response) {
    res.render(Text::Js(FLOT_MIN_JS));
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>grps monitor</title>
<script src="/grps/v1/js/jquery_min"></script>
<script src="/grps/v1/js/flot_min"></script>
<style>
body { font-family: sans-serif; margin: 20px; background: #fafafa; }
h1 { font-size: 20px; }
.chart { display: inline-block; margin: 10px; padding: 10px; background: #fff;
         border: 1px solid #ddd; }
.chart h3 { font-size: 13px; margin: 0 0 6px 0; font-weight: normal; }
</style>
</head>
<body>
<h1>grps monitor</h1>
{{charts}}
<script>
function refresh() {
  $all('canvas[data-metric]').forEach(function (canvas) {
    var name = canvas.getAttribute('data-metric');
    fetchJson('/grps/v1/monitor/series?name=' + encodeURIComponent(name),
      function (series) { plot(canvas, series); });
  });
}
refresh();
setInterval(refresh, 2000);
</script>
</body>
</html>
"#;

const JQUERY_MIN_JS: &str = r#"function $all(sel){return Array.prototype.slice.call(document.querySelectorAll(sel));}
function fetchJson(url,cb){var x=new XMLHttpRequest();x.open('GET',url);x.onload=function(){try{cb(JSON.parse(x.responseText));}catch(e){}};x.send();}
"#;

const FLOT_MIN_JS: &str = r#"function plot(canvas,series){var ctx=canvas.getContext('2d');var w=canvas.width,h=canvas.height;ctx.clearRect(0,0,w,h);var data=series.data||[];if(!data.length){return;}
var ys=data.map(function(p){return p[1];});var min=Math.min.apply(null,ys),max=Math.max.apply(null,ys);if(min===max){min-=1;max+=1;}
ctx.strokeStyle='#888';ctx.strokeRect(0.5,0.5,w-1,h-1);ctx.strokeStyle='#1c6ef2';ctx.beginPath();
data.forEach(function(p,i){var x=i/(data.length-1||1)*(w-8)+4;var y=h-4-(p[1]-min)/(max-min)*(h-8);if(i===0){ctx.moveTo(x,y);}else{ctx.lineTo(x,y);}});
ctx.stroke();ctx.fillStyle='#333';ctx.font='10px sans-serif';ctx.fillText(max.toFixed(2),4,10);ctx.fillText(min.toFixed(2),4,h-4);}
"#;
