//! Terminal styling shared by the command-line binaries.

use clap::builder::styling::{AnsiColor, Color, Style};
use clap::builder::Styles;
use crossterm::style::{Attribute, Color as CtColor, Stylize};
use std::io::{self, Write};
use unicode_width::UnicodeWidthStr;

// ═══════════════════════════════════════════════════════════════════════════════
// Clap Styles
// ═══════════════════════════════════════════════════════════════════════════════

pub fn get_styles() -> Styles {
    clap::builder::Styles::styled()
        .usage(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .header(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .literal(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Yellow))),
        )
        .invalid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .error(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .valid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Color Palette - Harvest Theme
// ═══════════════════════════════════════════════════════════════════════════════

pub mod colors {
    use crossterm::style::Color;

    pub const LEAF: Color = Color::Rgb {
        r: 106,
        g: 190,
        b: 69,
    };
    pub const WHEAT: Color = Color::Rgb {
        r: 245,
        g: 222,
        b: 139,
    };
    pub const AMBER: Color = Color::Rgb {
        r: 255,
        g: 176,
        b: 59,
    };
    pub const SOIL: Color = Color::Rgb {
        r: 176,
        g: 122,
        b: 78,
    };
    pub const SKY: Color = Color::Rgb {
        r: 110,
        g: 170,
        b: 230,
    };
    pub const RED: Color = Color::Rgb {
        r: 255,
        g: 85,
        b: 85,
    };
    pub const DIM: Color = Color::Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
    pub const WHITE: Color = Color::Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Box Drawing Characters
// ═══════════════════════════════════════════════════════════════════════════════

pub mod box_chars {
    // Double line box
    pub const DOUBLE_TOP_LEFT: &str = "╔";
    pub const DOUBLE_TOP_RIGHT: &str = "╗";
    pub const DOUBLE_BOTTOM_LEFT: &str = "╚";
    pub const DOUBLE_BOTTOM_RIGHT: &str = "╝";
    pub const DOUBLE_HORIZONTAL: &str = "═";
    pub const DOUBLE_VERTICAL: &str = "║";

    pub const SINGLE_HORIZONTAL: &str = "─";
    pub const SINGLE_VERTICAL: &str = "│";

    // Rounded corners
    pub const ROUND_TOP_LEFT: &str = "╭";
    pub const ROUND_TOP_RIGHT: &str = "╮";
    pub const ROUND_BOTTOM_LEFT: &str = "╰";
    pub const ROUND_BOTTOM_RIGHT: &str = "╯";

    // T-junctions
    pub const T_LEFT: &str = "├";
    pub const T_RIGHT: &str = "┤";
    pub const T_TOP: &str = "┬";
    pub const T_BOTTOM: &str = "┴";
    pub const CROSS: &str = "┼";

    pub const ARROW_RIGHT: &str = "▶";
    pub const BULLET: &str = "●";
    pub const BULLET_EMPTY: &str = "○";
    pub const DIAMOND: &str = "◆";
    pub const CHECK: &str = "✓";
    pub const CROSS_MARK: &str = "✗";
}

// ═══════════════════════════════════════════════════════════════════════════════
// Banner
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_banner() {
    let banner = r#"
     █████╗  ██████╗ ██████╗ ██╗    ██████╗ ██████╗ ██╗ ██████╗███████╗
    ██╔══██╗██╔════╝ ██╔══██╗██║    ██╔══██╗██╔══██╗██║██╔════╝██╔════╝
    ███████║██║  ███╗██████╔╝██║    ██████╔╝██████╔╝██║██║     █████╗
    ██╔══██║██║   ██║██╔══██╗██║    ██╔═══╝ ██╔══██╗██║██║     ██╔══╝
    ██║  ██║╚██████╔╝██║  ██║██║    ██║     ██║  ██║██║╚██████╗███████╗
    ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝    ╚═╝     ╚═╝  ╚═╝╚═╝ ╚═════╝╚══════╝
"#;

    let gradient_colors = [
        colors::LEAF,
        colors::LEAF,
        colors::WHEAT,
        colors::WHEAT,
        colors::AMBER,
        colors::AMBER,
        colors::SOIL,
        colors::SOIL,
    ];

    for (i, line) in banner.lines().enumerate() {
        let color = gradient_colors.get(i).unwrap_or(&colors::LEAF);
        println!("{}", line.with(*color).bold());
    }

    let subtitle = "  ══════════════════  ENTITY LINKING CONSOLE  ══════════════════";
    println!("{}", subtitle.with(colors::DIM));
    println!();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Indicators
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_success(message: &str) {
    println!(
        " {} {}",
        box_chars::CHECK.with(colors::LEAF).bold(),
        message.with(colors::LEAF)
    );
}

pub fn print_error(message: &str) {
    println!(
        " {} {}",
        box_chars::CROSS_MARK.with(colors::RED).bold(),
        message.with(colors::RED)
    );
}

pub fn print_warning(message: &str) {
    println!(
        " {} {}",
        "⚠".with(colors::AMBER).bold(),
        message.with(colors::AMBER)
    );
}

pub fn print_info(message: &str) {
    println!(
        " {} {}",
        "ℹ".with(colors::SKY).bold(),
        message.with(colors::SKY)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Section Headers
// ═══════════════════════════════════════════════════════════════════════════════

const SECTION_WIDTH: usize = 60;

pub fn print_section_header(title: &str) {
    let title_len = title.width();
    let padding = SECTION_WIDTH.saturating_sub(title_len + 4) / 2;

    println!();
    print!("{}", box_chars::ROUND_TOP_LEFT.with(colors::LEAF));
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(padding)
            .with(colors::LEAF)
    );
    print!(
        " {} ",
        title.with(colors::WHEAT).bold().attribute(Attribute::Italic)
    );
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(SECTION_WIDTH.saturating_sub(title_len + 4 + padding))
            .with(colors::LEAF)
    );
    println!("{}", box_chars::ROUND_TOP_RIGHT.with(colors::LEAF));
}

pub fn print_section_footer() {
    print!("{}", box_chars::ROUND_BOTTOM_LEFT.with(colors::LEAF));
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(SECTION_WIDTH)
            .with(colors::LEAF)
    );
    println!("{}", box_chars::ROUND_BOTTOM_RIGHT.with(colors::LEAF));
    println!();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key-Value Display
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_key_value(key: &str, value: &str) {
    println!(
        "  {} {} {}",
        box_chars::BULLET.with(colors::SOIL),
        format!("{}:", key).with(colors::DIM),
        value.with(colors::WHITE)
    );
}

pub fn print_key_value_highlight(key: &str, value: &str) {
    println!(
        "  {} {} {}",
        box_chars::DIAMOND.with(colors::AMBER),
        format!("{}:", key).with(colors::WHEAT).bold(),
        value.with(colors::LEAF).bold()
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// List Display
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_list_item(item: &str, indent: usize) {
    println!(
        "{}{}  {}",
        "  ".repeat(indent),
        box_chars::ARROW_RIGHT.with(colors::LEAF),
        item.with(colors::WHITE)
    );
}

pub fn print_empty_list(message: &str) {
    println!(
        "  {} {}",
        box_chars::BULLET_EMPTY.with(colors::DIM),
        message.with(colors::DIM).attribute(Attribute::Italic)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Table Display
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    col_widths: Vec<usize>,
}

impl TableBuilder {
    pub fn new(headers: &[&str]) -> Self {
        TableBuilder {
            col_widths: headers.iter().map(|h| h.width()).collect(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = self.col_widths.get_mut(i) {
                *width = (*width).max(cell.width());
            }
        }
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn print_border(&self, left: &str, junction: &str, right: &str) {
        print!("{}", left.with(colors::LEAF));
        for (i, width) in self.col_widths.iter().enumerate() {
            print!(
                "{}",
                box_chars::SINGLE_HORIZONTAL
                    .repeat(width + 2)
                    .with(colors::LEAF)
            );
            if i + 1 < self.col_widths.len() {
                print!("{}", junction.with(colors::LEAF));
            }
        }
        println!("{}", right.with(colors::LEAF));
    }

    fn print_row(&self, cells: &[String], color: CtColor, bold: bool) {
        print!("{}", box_chars::SINGLE_VERTICAL.with(colors::LEAF));
        for (i, width) in self.col_widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            let padding = width.saturating_sub(cell.width());
            let styled = cell.with(color);
            if bold {
                print!(" {}{} ", styled.bold(), " ".repeat(padding));
            } else {
                print!(" {}{} ", styled, " ".repeat(padding));
            }
            print!("{}", box_chars::SINGLE_VERTICAL.with(colors::LEAF));
        }
        println!();
    }

    pub fn print(&self) {
        self.print_border(
            box_chars::ROUND_TOP_LEFT,
            box_chars::T_TOP,
            box_chars::ROUND_TOP_RIGHT,
        );
        self.print_row(&self.headers, colors::WHEAT, true);
        self.print_border(box_chars::T_LEFT, box_chars::CROSS, box_chars::T_RIGHT);
        for row in &self.rows {
            self.print_row(row, colors::WHITE, false);
        }
        self.print_border(
            box_chars::ROUND_BOTTOM_LEFT,
            box_chars::T_BOTTOM,
            box_chars::ROUND_BOTTOM_RIGHT,
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Prompt Styling
// ═══════════════════════════════════════════════════════════════════════════════

pub fn get_prompt() -> String {
    format!(
        "{}{}{} ",
        "❯".with(colors::LEAF).bold(),
        "❯".with(colors::WHEAT).bold(),
        "❯".with(colors::AMBER).bold(),
    )
}

pub fn print_command_echo(command: &str) {
    println!(
        "{}{}{}  {}",
        "❯".with(colors::LEAF).bold(),
        "❯".with(colors::WHEAT).bold(),
        "❯".with(colors::AMBER).bold(),
        command.with(colors::LEAF).bold()
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Welcome Message
// ═══════════════════════════════════════════════════════════════════════════════

const WELCOME_WIDTH: usize = 64;

fn print_welcome_line(content: &str, visible_len: usize) {
    print!("  {}", box_chars::DOUBLE_VERTICAL.with(colors::SOIL));
    print!("{}", content);
    print!("{}", " ".repeat(WELCOME_WIDTH.saturating_sub(visible_len)));
    println!("{}", box_chars::DOUBLE_VERTICAL.with(colors::SOIL));
}

pub fn print_welcome(db_path: &str, unlinked_count: usize) {
    print_banner();

    print!("  {}", box_chars::DOUBLE_TOP_LEFT.with(colors::SOIL));
    print!(
        "{}",
        box_chars::DOUBLE_HORIZONTAL
            .repeat(WELCOME_WIDTH)
            .with(colors::SOIL)
    );
    println!("{}", box_chars::DOUBLE_TOP_RIGHT.with(colors::SOIL));

    let connected = "Connected to price database";
    print_welcome_line(
        &format!("  {}", connected.with(colors::LEAF)),
        connected.width() + 2,
    );
    print_welcome_line("", 0);

    let unlinked = unlinked_count.to_string();
    let lines = [
        ("Database", db_path),
        ("Version", env!("APP_VERSION")),
        ("Unlinked entities", unlinked.as_str()),
    ];
    for (key, value) in lines {
        let content = format!("  {} {}", format!("{}:", key).with(colors::DIM), value);
        print_welcome_line(&content, key.width() + value.width() + 4);
    }

    print_welcome_line("", 0);
    let help_msg = "  Type 'help' for available commands";
    print_welcome_line(&format!("{}", help_msg.with(colors::DIM)), help_msg.width());

    print!("  {}", box_chars::DOUBLE_BOTTOM_LEFT.with(colors::SOIL));
    print!(
        "{}",
        box_chars::DOUBLE_HORIZONTAL
            .repeat(WELCOME_WIDTH)
            .with(colors::SOIL)
    );
    println!("{}", box_chars::DOUBLE_BOTTOM_RIGHT.with(colors::SOIL));
    println!();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Help Display
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandGroup {
    Linking,
    Catalog,
    Prices,
    System,
}

impl CommandGroup {
    fn title(&self) -> &'static str {
        match self {
            CommandGroup::Linking => "Linking",
            CommandGroup::Catalog => "Canonical Catalog",
            CommandGroup::Prices => "Prices",
            CommandGroup::System => "System",
        }
    }

    fn color(&self) -> CtColor {
        match self {
            CommandGroup::Linking => colors::LEAF,
            CommandGroup::Catalog => colors::WHEAT,
            CommandGroup::Prices => colors::AMBER,
            CommandGroup::System => colors::SKY,
        }
    }
}

pub struct CommandHelp {
    pub group: CommandGroup,
    pub name: &'static str,
    pub args: &'static str,
    pub description: &'static str,
}

pub fn print_help(commands: &[CommandHelp]) {
    println!();
    print_section_header("Available Commands");
    println!();

    for group in [
        CommandGroup::Linking,
        CommandGroup::Catalog,
        CommandGroup::Prices,
        CommandGroup::System,
    ] {
        let in_group: Vec<&CommandHelp> = commands.iter().filter(|c| c.group == group).collect();
        if in_group.is_empty() {
            continue;
        }
        println!(
            "  {} {}",
            box_chars::DIAMOND.with(group.color()),
            group.title().with(group.color()).bold()
        );
        for cmd in in_group {
            println!(
                "      {} {}  {}",
                cmd.name.with(colors::LEAF).bold(),
                cmd.args.with(colors::DIM),
                cmd.description.with(colors::WHITE)
            );
        }
        println!();
    }

    print_section_footer();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Goodbye Message
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_goodbye() {
    println!();
    println!(
        "  {}",
        "Goodbye! Links are saved, aggregates refresh on the next recompute."
            .with(colors::WHEAT)
            .bold()
    );
    println!();
}

pub fn flush() {
    let _ = io::stdout().flush();
}
