use comrak::options::{ListStyleType, Options};

pub(crate) fn default_options() -> Options<'static> {
    let mut options = Options::default();
    configure_extensions(&mut options);
    options
}

fn configure_extensions(options: &mut Options<'static>) {
    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.tagfilter = false;
    ext.table = true;
    ext.autolink = true;
    ext.tasklist = true;
    ext.footnotes = true;
    // Math is lifted out before parsing; comrak must not claim `$`.
    ext.math_dollars = false;
    ext.math_code = false;

    let render = &mut options.render;
    render.hardbreaks = false;
    render.github_pre_lang = true;
    render.full_info_string = true;
    render.tasklist_classes = true;
    render.list_style = ListStyleType::Dash;
    // Code blocks are swapped for pre-rendered HTML blocks.
    render.r#unsafe = true;
    render.sourcepos = false;
}
