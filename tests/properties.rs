use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use rstest::rstest;
use shimmyssi::{
    evaluate, parse, parse_with, render, EvalError, EvaluationContext, EvaluationResult,
    IncludeTarget, MemoryResolver, Metadata, ParseError, ParseOptions, RecoverableKind,
    ResolveError, Resolver, DEFAULT_ECHOMSG, DEFAULT_ERRMSG,
};

fn run(input: &str, ctx: EvaluationContext, resolver: &MemoryResolver) -> EvaluationResult {
    render(input.as_bytes(), ctx, resolver).unwrap()
}

fn text(input: &str, ctx: EvaluationContext) -> String {
    run(input, ctx, &MemoryResolver::new()).output_lossy().into_owned()
}

// ── Literal round-trip ──

#[rstest]
#[case("")]
#[case("plain text")]
#[case("<html><!-- ordinary comment --></html>")]
#[case("<!-- # not a directive -->")]
#[case("trailing newline\n\n")]
fn documents_without_directives_render_verbatim(#[case] input: &str) {
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output, input.as_bytes());
    assert!(result.errors.is_empty());
}

// ── Conditionals ──

const CHAIN: &str = concat!(
    "<!--#if expr=\"$x = a\" -->A",
    "<!--#elif expr=\"$x = b\" -->B",
    "<!--#elif expr=\"$x = /^b/\" -->B2",
    "<!--#else -->Z",
    "<!--#endif -->",
);

#[rstest]
#[case("a", "A")]
#[case("b", "B")]
#[case("bb", "B2")]
#[case("c", "Z")]
fn exactly_one_branch_is_taken(#[case] x: &str, #[case] expected: &str) {
    assert_eq!(text(CHAIN, EvaluationContext::new().with_var("x", x)), expected);
}

#[test]
fn no_branch_without_else() {
    let input = "[<!--#if expr=\"$x\" -->yes<!--#endif -->]";
    assert_eq!(text(input, EvaluationContext::new()), "[]");
}

#[test]
fn nested_conditionals() {
    let input = concat!(
        "<!--#if expr=\"$a\" -->",
        "<!--#if expr=\"$b\" -->ab<!--#else -->a<!--#endif -->",
        "<!--#else -->none",
        "<!--#endif -->",
    );
    let ctx = EvaluationContext::new().with_var("a", "1");
    assert_eq!(text(input, ctx.clone()), "a");
    assert_eq!(text(input, ctx.with_var("b", "1")), "ab");
}

#[rstest]
#[case("\\\"a\\\"==\\\"a\\\" || $untouched", "yes")]
#[case("'a' == 'a' || $untouched", "yes")]
#[case("'' && $untouched", "no")]
#[case("!('a' = 'a') && $untouched", "no")]
fn boolean_operators_short_circuit(#[case] expr: &str, #[case] expected: &str) {
    let ctx = EvaluationContext::new()
        .with_fallback(|name| panic!("`{name}` should not have been looked up"));
    let input = format!("<!--#if expr=\"{expr}\" -->yes<!--#else -->no<!--#endif -->");
    assert_eq!(text(&input, ctx), expected);
}

#[rstest]
#[case("$v < b", true)]
#[case("$v >= b", false)]
#[case("$v != 'a'", false)]
#[case("$v =~ /^A/", false)]
#[case("$v !~ /^A/", true)]
#[case("($v = a) && !($v = b)", true)]
fn comparison_operators(#[case] expr: &str, #[case] expected: bool) {
    let ctx = EvaluationContext::new().with_var("v", "a");
    let input = format!("<!--#if expr=\"{expr}\" -->1<!--#endif -->");
    assert_eq!(text(&input, ctx) == "1", expected);
}

#[test]
fn regex_match_stores_captures() {
    let input = concat!(
        "<!--#if expr=\"$email = /(.+)@(?P<domain>.+)/\" -->",
        "<!--#echo var=\"1\" --> at <!--#echo var=\"domain\" -->",
        "<!--#endif -->",
    );
    let ctx = EvaluationContext::new().with_var("email", "user@example.com");
    let result = run(input, ctx, &MemoryResolver::new());
    assert_eq!(result.output_lossy(), "user at example.com");
    assert_eq!(result.context.get("0").as_deref(), Some("user@example.com"));
}

#[test]
fn quoted_pattern_match_stores_captures() {
    let input = concat!(
        "<!--#if expr=\"$range =~ '(\\d+)-(\\d+)'\" -->",
        "<!--#echo var=\"2\" -->/<!--#echo var=\"1\" -->",
        "<!--#endif -->",
    );
    let ctx = EvaluationContext::new().with_var("range", "10-20");
    let result = run(input, ctx, &MemoryResolver::new());
    assert_eq!(result.output_lossy(), "20/10");
    assert_eq!(result.context.get("0").as_deref(), Some("10-20"));
}

#[test]
fn overly_nested_condition_is_a_parse_error() {
    let input = format!("<!--#if expr=\"{}$a\" -->x<!--#endif -->", "(".repeat(200_000));
    let err = parse(input.as_bytes()).unwrap_err();
    assert!(matches!(
        err,
        ParseError::MalformedExpression { offset: 0, ref message, .. } if message == "expression nested too deeply"
    ));
}

// ── Variables ──

#[test]
fn set_takes_effect_in_document_order() {
    let input = concat!(
        "<!--#echo var=\"x\" -->|",
        "<!--#set var=\"x\" value=\"1\" -->",
        "<!--#echo var=\"x\" -->|",
        "<!--#set var=\"x\" value=\"${x}2\" -->",
        "<!--#echo var=\"x\" -->",
    );
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output_lossy(), format!("{DEFAULT_ECHOMSG}|1|12"));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, RecoverableKind::UndefinedVariable);
    assert_eq!(result.errors[0].offset, 0);
}

#[test]
fn substituted_values_are_not_rescanned() {
    let input = concat!(
        "<!--#set var=\"y\" value=\"secret\" -->",
        "<!--#set var=\"x\" value=\"\\$y\" -->",
        "<!--#set var=\"z\" value=\"$x\" -->",
        "<!--#echo var=\"z\" encoding=\"none\" -->",
    );
    assert_eq!(text(input, EvaluationContext::new()), "$y");
}

#[rstest]
#[case("none", "a b<&>")]
#[case("entity", "a b&lt;&amp;&gt;")]
#[case("url", "a%20b%3C%26%3E")]
fn echo_encodings(#[case] encoding: &str, #[case] expected: &str) {
    let ctx = EvaluationContext::new().with_var("v", "a b<&>");
    let input = format!("<!--#echo var=\"v\" encoding=\"{encoding}\" -->");
    assert_eq!(text(&input, ctx), expected);
}

#[test]
fn echo_defaults_to_entity_encoding() {
    let ctx = EvaluationContext::new().with_var("v", "\"'");
    assert_eq!(text("<!--#echo var=\"v\" -->", ctx), "&quot;&#39;");
}

#[test]
fn echo_default_attribute_replaces_echomsg() {
    let result = run(
        "<!--#echo var=\"missing\" default=\"n/a\" -->",
        EvaluationContext::new(),
        &MemoryResolver::new(),
    );
    assert_eq!(result.output_lossy(), "n/a");
    assert!(result.errors.is_empty());
}

#[test]
fn config_echomsg_changes_undefined_text() {
    let input = "<!--#config echomsg=\"?\" --><!--#echo var=\"missing\" -->";
    assert_eq!(text(input, EvaluationContext::new()), "?");
}

#[test]
fn date_variables_follow_timefmt() {
    let now = Utc.with_ymd_and_hms(2021, 6, 7, 8, 9, 10).unwrap();
    let input = "<!--#config timefmt=\"%Y/%m/%d\" --><!--#echo var=\"DATE_GMT\" -->";
    assert_eq!(text(input, EvaluationContext::new().with_now(now)), "2021/06/07");
}

#[test]
fn printenv_lists_variables_sorted() {
    let ctx = EvaluationContext::new().with_var("b", "<x>").with_var("a", "1");
    assert_eq!(text("<!--#printenv -->", ctx), "a=1\nb=&lt;x&gt;\n");
}

#[test]
fn comments_and_unknown_directives_emit_nothing() {
    let input = "a<!--#comment text=\"hidden\" -->b<!--#exec cmd=\"ls\" -->c";
    assert_eq!(text(input, EvaluationContext::new()), "abc");
}

// ── Includes ──

#[test]
fn failing_include_emits_errmsg_and_continues() {
    let result = run(
        "before<!--#include virtual=\"/missing\" -->after",
        EvaluationContext::new(),
        &MemoryResolver::new(),
    );
    assert_eq!(result.output_lossy(), format!("before{DEFAULT_ERRMSG}after"));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, RecoverableKind::Resolve);
    assert_eq!(result.errors[0].offset, 6);
    assert_eq!(result.errors[0].directive, "include");
}

#[test]
fn include_paths_are_substituted() {
    let resolver = MemoryResolver::new().with_virtual("/about.html", "ABOUT");
    let input = "<!--#set var=\"page\" value=\"about\" --><!--#include virtual=\"/${page}.html\" -->";
    assert_eq!(run(input, EvaluationContext::new(), &resolver).output_lossy(), "ABOUT");
}

#[test]
fn included_bytes_are_not_parsed() {
    let resolver = MemoryResolver::new().with_file("raw.inc", "<!--#echo var=\"x\" -->");
    let ctx = EvaluationContext::new().with_var("x", "1");
    let result = run("<!--#include file=\"raw.inc\" -->", ctx, &resolver);
    assert_eq!(result.output_lossy(), "<!--#echo var=\"x\" -->");
}

#[test]
fn onerror_falls_back_to_second_target() {
    let resolver = MemoryResolver::new().with_virtual("/fallback", "FB");
    let input = "<!--#include virtual=\"/missing\" onerror=\"/fallback\" -->";
    let result = run(input, EvaluationContext::new(), &resolver);
    assert_eq!(result.output_lossy(), "FB");
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn stub_block_replaces_empty_include() {
    let resolver = MemoryResolver::new().with_virtual("/empty", "");
    let input = concat!(
        "<!--#block name=\"one\" -->stub<!--#endblock -->",
        "[<!--#include virtual=\"/empty\" stub=\"one\" -->]",
        "[<!--#include virtual=\"/missing\" stub=\"one\" -->]",
    );
    let result = run(input, EvaluationContext::new(), &resolver);
    assert_eq!(result.output_lossy(), "[stub][stub]");
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn unknown_stub_is_recoverable() {
    let resolver = MemoryResolver::new().with_virtual("/empty", "");
    let result = run(
        "<!--#include virtual=\"/empty\" stub=\"nope\" -->",
        EvaluationContext::new(),
        &resolver,
    );
    assert_eq!(result.output_lossy(), "");
    assert_eq!(result.errors[0].kind, RecoverableKind::UnknownBlock);
}

#[test]
fn self_referencing_stub_stops_at_the_cycle() {
    let input = concat!(
        "<!--#block name=\"a\" -->",
        "<!--#include virtual=\"/missing\" stub=\"a\" -->",
        "<!--#endblock -->",
        "<!--#include virtual=\"/missing\" stub=\"a\" -->after",
    );
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output_lossy(), format!("{DEFAULT_ERRMSG}after"));
    let kinds: Vec<_> = result.errors.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RecoverableKind::Resolve,
            RecoverableKind::Resolve,
            RecoverableKind::RecursiveBlock,
        ]
    );
}

#[test]
fn mutually_recursive_stubs_stop_at_the_cycle() {
    let input = concat!(
        "<!--#block name=\"a\" -->a<!--#include virtual=\"/x\" stub=\"b\" --><!--#endblock -->",
        "<!--#block name=\"b\" -->b<!--#include virtual=\"/x\" stub=\"a\" --><!--#endblock -->",
        "<!--#config errmsg=\"!\" -->",
        "<!--#include virtual=\"/x\" stub=\"a\" -->",
    );
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output_lossy(), "ab!");
    assert_eq!(
        result.errors.last().map(|e| e.kind),
        Some(RecoverableKind::RecursiveBlock)
    );
}

#[test]
fn echo_renders_a_block_of_that_name() {
    let input = concat!(
        "<!--#block name=\"nav\" --><a href=\"/\">home</a><!--#endblock -->",
        "<!--#echo var=\"nav\" -->",
    );
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output_lossy(), "<a href=\"/\">home</a>");
    assert!(result.errors.is_empty());
}

#[test]
fn variables_shadow_blocks_in_echo() {
    let input = "<!--#block name=\"x\" -->block<!--#endblock --><!--#echo var=\"x\" -->";
    assert_eq!(text(input, EvaluationContext::new().with_var("x", "var")), "var");
}

#[test]
fn block_echoing_itself_stops_at_the_cycle() {
    let input = concat!(
        "<!--#block name=\"loop\" -->[<!--#echo var=\"loop\" -->]<!--#endblock -->",
        "<!--#config errmsg=\"!\" -->",
        "<!--#echo var=\"loop\" -->",
    );
    let result = run(input, EvaluationContext::new(), &MemoryResolver::new());
    assert_eq!(result.output_lossy(), "[!]");
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, RecoverableKind::RecursiveBlock);
}

#[test]
fn include_set_stores_instead_of_emitting() {
    let resolver = MemoryResolver::new().with_virtual("/foo", "<b>foo</b>");
    let input = "<!--#include virtual=\"/foo\" set=\"name\" -->=<!--#echo var=\"name\" encoding=\"none\" -->";
    let result = run(input, EvaluationContext::new(), &resolver);
    assert_eq!(result.output_lossy(), "=<b>foo</b>");
    assert_eq!(result.context.get("name").as_deref(), Some("<b>foo</b>"));
}

struct Broken;

impl Resolver for Broken {
    fn resolve(&self, _: &IncludeTarget) -> Result<Vec<u8>, ResolveError> {
        Err(ResolveError::Fatal("backend gone".into()))
    }

    fn metadata(&self, _: &IncludeTarget) -> Result<Metadata, ResolveError> {
        Err(ResolveError::Fatal("backend gone".into()))
    }
}

#[test]
fn fatal_resolver_errors_abort() {
    let tree = parse(b"ok<!--#include file=\"x\" -->").unwrap();
    let err = evaluate(&tree, EvaluationContext::new(), &Broken).unwrap_err();
    let EvalError::Resolver { directive, offset, source } = err;
    assert_eq!(directive, "include");
    assert_eq!(offset, 2);
    assert!(source.is_fatal());
}

// ── File information ──

fn sized_resolver() -> MemoryResolver {
    let when = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
    MemoryResolver::new()
        .with_file("f.bin", vec![0u8; 2048])
        .modified(&IncludeTarget::File("f.bin".into()), when)
}

#[rstest]
#[case("<!--#fsize file=\"f.bin\" -->", "2.0K")]
#[case("<!--#config sizefmt=\"bytes\" --><!--#fsize file=\"f.bin\" -->", "2,048")]
#[case("<!--#config timefmt=\"%Y-%m-%d %H:%M\" --><!--#flastmod file=\"f.bin\" -->", "2020-01-02 03:04")]
fn file_information(#[case] input: &str, #[case] expected: &str) {
    let result = run(input, EvaluationContext::new(), &sized_resolver());
    assert_eq!(result.output_lossy(), expected);
}

#[test]
fn missing_file_information_uses_errmsg() {
    let input = "<!--#config errmsg=\"[x]\" --><!--#fsize virtual=\"/nope\" --><!--#flastmod virtual=\"/nope\" -->";
    let result = run(input, EvaluationContext::new(), &sized_resolver());
    assert_eq!(result.output_lossy(), "[x][x]");
    assert_eq!(result.errors.len(), 2);
}

// ── Configuration lifetime ──

#[test]
fn config_is_reset_between_runs() {
    let resolver = MemoryResolver::new();
    let first = parse(b"<!--#config errmsg=\"custom\" -->").unwrap();
    let second = parse(b"<!--#include virtual=\"/missing\" -->").unwrap();

    let result = evaluate(&first, EvaluationContext::new(), &resolver).unwrap();
    assert_eq!(result.context.config().errmsg, "custom");

    let result = evaluate(&second, result.context, &resolver).unwrap();
    assert_eq!(result.output_lossy(), DEFAULT_ERRMSG);
}

#[test]
fn one_tree_many_contexts() {
    let tree = parse(b"<!--#echo var=\"who\" -->").unwrap();
    let resolver = MemoryResolver::new();
    for who in ["ann", "bo"] {
        let ctx = EvaluationContext::new().with_var("who", who);
        assert_eq!(evaluate(&tree, ctx, &resolver).unwrap().output_lossy(), who);
    }
}

// ── Structural errors ──

#[test]
fn stray_endif_reports_its_offset() {
    let err = parse(b"abc<!--#endif -->").unwrap_err();
    assert_eq!(
        err,
        ParseError::Unmatched {
            directive: "endif".into(),
            expected: "if".into(),
            offset: 3,
        }
    );
}

#[test]
fn unclosed_if_reports_opener() {
    let err = parse(b"x<!--#if expr=\"$a\" -->never closed").unwrap_err();
    assert_eq!(
        err,
        ParseError::Unclosed {
            directive: "if".into(),
            offset: 1,
        }
    );
}

#[test]
fn unterminated_tag_is_fatal() {
    let err = parse(b"ok <!--#echo var=\"a\" ").unwrap_err();
    assert_eq!(err, ParseError::UnterminatedDirective { offset: 3 });
}

#[rstest]
#[case("<!--#echo var=\"a\" colour=\"red\" -->")]
#[case("<!--#echo var=\"a\" var=\"b\" -->")]
fn strict_policy_rejects_what_lenient_accepts(#[case] input: &str) {
    assert!(parse(input.as_bytes()).is_ok());
    let err = parse_with(input.as_bytes(), &ParseOptions::strict()).unwrap_err();
    assert!(matches!(
        err,
        ParseError::UnknownAttribute { offset: 0, .. } | ParseError::DuplicateAttribute { offset: 0, .. }
    ));
}

#[test]
fn lenient_duplicates_keep_the_last_value() {
    let ctx = EvaluationContext::new().with_var("a", "A").with_var("b", "B");
    assert_eq!(text("<!--#echo var=\"a\" var=\"b\" -->", ctx), "B");
}
